use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use scraper::{Html, Selector};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ScrapeConfig, SourceConfig};
use crate::models::{content_hash, ErrorKind, JobPosting, SourceId};

/// Page-fetching collaborator. Production uses HTTP; tests script responses.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("pursuit/0.1")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(FetchedPage { status, body })
    }
}

/// A terminal per-source failure, yielded in the stream instead of raised so
/// the orchestrator can continue with other sources.
#[derive(Debug, Clone)]
pub struct SourceFailure {
    pub source: String,
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub enum SearchItem {
    Posting(JobPosting),
    SourceFailed(SourceFailure),
}

/// Fetches postings from configured sources under rate-limit and anti-block
/// policy. Holds per-source pacing state; never raises a fatal error for a
/// single source.
pub struct Scraper {
    config: ScrapeConfig,
    fetcher: Arc<dyn PageFetcher>,
    /// Earliest next-allowed instant per source. Sources pace independently.
    gates: tokio::sync::Mutex<HashMap<String, Instant>>,
}

impl Scraper {
    pub fn new(config: ScrapeConfig, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            config,
            fetcher,
            gates: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Starts a lazy search over one source. The stream is finite and not
    /// restartable; a fresh search re-issues the fetch.
    pub fn search<'a>(&'a self, source: &SourceConfig, query: &str) -> SearchStream<'a> {
        SearchStream {
            scraper: self,
            source: source.clone(),
            query: query.to_string(),
            page: 1,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Reserves this source's next request slot, sleeping until it opens.
    async fn wait_turn(&self, source: &str, min_delay: Duration) {
        let scheduled = {
            let mut gates = self.gates.lock().await;
            let now = Instant::now();
            let slot = gates.entry(source.to_string()).or_insert(now);
            let at = (*slot).max(now);
            *slot = at + min_delay;
            at
        };
        let now = Instant::now();
        if scheduled > now {
            tokio::time::sleep(scheduled - now).await;
        }
    }

    /// Exponential backoff with jitter: base × 2^attempt, capped. The jitter
    /// never pushes the delay past the cap.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let raw = raw_backoff_ms(&self.config, attempt);
        let jitter_max = (self.config.base_backoff_ms / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_max);
        Duration::from_millis((raw + jitter).min(self.config.backoff_cap_ms))
    }

    /// One listing page, with retry for retryable failures. Captcha and
    /// structural failures are terminal immediately; rate-limit and transport
    /// failures retry with backoff up to the attempt ceiling.
    async fn fetch_page(
        &self,
        source: &SourceConfig,
        query: &str,
        page: u32,
    ) -> std::result::Result<Vec<JobPosting>, SourceFailure> {
        let url = source
            .search_url
            .replace("{query}", &query.replace(' ', "+"))
            .replace("{page}", &page.to_string());

        let mut attempt: u32 = 0;
        loop {
            self.wait_turn(&source.name, Duration::from_millis(source.min_request_delay_ms))
                .await;

            let fetched = tokio::time::timeout(
                Duration::from_secs(self.config.fetch_timeout_secs),
                self.fetcher.fetch(&url),
            )
            .await;

            let failure = match fetched {
                Ok(Ok(fetched)) => match classify_page(source, &fetched) {
                    PageClass::Ok => {
                        return parse_listing(source, &fetched.body).map_err(|detail| {
                            tracing::warn!(source = %source.name, %detail, "structural mismatch");
                            SourceFailure {
                                source: source.name.clone(),
                                kind: ErrorKind::StructuralMismatch,
                                detail,
                            }
                        });
                    }
                    PageClass::Captcha(marker) => {
                        // Retrying a CAPTCHA wall wastes quota and risks the
                        // account; abort this source at once.
                        tracing::warn!(source = %source.name, %marker, "captcha detected");
                        return Err(SourceFailure {
                            source: source.name.clone(),
                            kind: ErrorKind::CaptchaBlocked,
                            detail: format!("challenge marker '{marker}' on {url}"),
                        });
                    }
                    PageClass::RateLimited(detail) => SourceFailure {
                        source: source.name.clone(),
                        kind: ErrorKind::RateLimited,
                        detail,
                    },
                    PageClass::Transport(detail) => SourceFailure {
                        source: source.name.clone(),
                        kind: ErrorKind::TransportError,
                        detail,
                    },
                },
                Ok(Err(err)) => SourceFailure {
                    source: source.name.clone(),
                    kind: ErrorKind::TransportError,
                    detail: err.to_string(),
                },
                Err(_elapsed) => SourceFailure {
                    source: source.name.clone(),
                    kind: ErrorKind::TransportError,
                    detail: format!("fetch timed out after {}s", self.config.fetch_timeout_secs),
                },
            };

            attempt += 1;
            if attempt >= self.config.max_fetch_attempts {
                tracing::warn!(
                    source = %source.name,
                    kind = %failure.kind,
                    attempts = attempt,
                    "giving up on source"
                );
                return Err(failure);
            }

            let delay = self.backoff_delay(attempt - 1);
            tracing::debug!(
                source = %source.name,
                kind = %failure.kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

pub(crate) fn raw_backoff_ms(config: &ScrapeConfig, attempt: u32) -> u64 {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    config
        .base_backoff_ms
        .saturating_mul(factor)
        .min(config.backoff_cap_ms)
}

enum PageClass {
    Ok,
    Captcha(String),
    RateLimited(String),
    Transport(String),
}

fn classify_page(source: &SourceConfig, page: &FetchedPage) -> PageClass {
    let body = page.body.to_lowercase();

    // Challenge markers win over status: a 200 captcha wall is still a wall.
    for marker in &source.captcha_markers {
        if body.contains(&marker.to_lowercase()) {
            return PageClass::Captcha(marker.clone());
        }
    }

    if page.status == 429 || page.status == 503 {
        return PageClass::RateLimited(format!("status {}", page.status));
    }
    for marker in &source.block_markers {
        if body.contains(&marker.to_lowercase()) {
            return PageClass::RateLimited(format!("block marker '{marker}'"));
        }
    }

    if !(200..300).contains(&page.status) {
        return PageClass::Transport(format!("status {}", page.status));
    }

    PageClass::Ok
}

/// Parses one listing page into postings. Any absent expected field aborts
/// with the selector name so the mismatch is diagnosable.
fn parse_listing(source: &SourceConfig, body: &str) -> std::result::Result<Vec<JobPosting>, String> {
    let selectors = &source.selectors;
    let card_sel = compile(&selectors.card)?;
    let title_sel = compile(&selectors.title)?;
    let company_sel = compile(&selectors.company)?;
    let location_sel = compile(&selectors.location)?;
    let description_sel = compile(&selectors.description)?;
    let apply_sel = compile(&selectors.apply_link)?;

    let document = Html::parse_document(body);
    let mut postings = Vec::new();

    for card in document.select(&card_sel) {
        let title =
            select_text(&card, &title_sel).ok_or_else(|| missing(&selectors.title))?;
        let company =
            select_text(&card, &company_sel).ok_or_else(|| missing(&selectors.company))?;
        let location =
            select_text(&card, &location_sel).ok_or_else(|| missing(&selectors.location))?;
        let description =
            select_text(&card, &description_sel).ok_or_else(|| missing(&selectors.description))?;
        let apply_url = card
            .select(&apply_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string)
            .ok_or_else(|| missing(&selectors.apply_link))?;

        let native_id = native_id_from(&apply_url, &title, &company);
        postings.push(JobPosting::new(
            SourceId::new(source.name.clone(), native_id),
            title,
            company,
            location,
            description,
            apply_url,
        ));
    }

    if postings.is_empty() {
        return Err(format!("card selector '{}' matched nothing", selectors.card));
    }
    Ok(postings)
}

fn compile(selector: &str) -> std::result::Result<Selector, String> {
    Selector::parse(selector).map_err(|_| format!("unparseable selector '{selector}'"))
}

fn missing(selector: &str) -> String {
    format!("expected field absent for selector '{selector}'")
}

fn select_text(card: &scraper::ElementRef, selector: &Selector) -> Option<String> {
    let element = card.select(selector).next()?;
    let text: String = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() { None } else { Some(text) }
}

/// Site-native id: the last meaningful path segment of the apply URL, or a
/// short content hash when the URL carries none.
fn native_id_from(apply_url: &str, title: &str, company: &str) -> String {
    let trimmed = apply_url.trim_end_matches('/');
    let segment = trimmed.rsplit('/').next().unwrap_or("");
    let segment = segment.rsplit('=').next().unwrap_or(segment);
    if !segment.is_empty() && segment.len() <= 64 && !segment.contains('.') {
        segment.to_string()
    } else {
        content_hash(&format!("{title}|{company}")).chars().take(12).collect()
    }
}

// --- Lazy search stream ---

/// One in-flight search. Fetches pages on demand; ends after the last page,
/// an empty page, or a terminal source failure.
pub struct SearchStream<'a> {
    scraper: &'a Scraper,
    source: SourceConfig,
    query: String,
    page: u32,
    buffer: VecDeque<JobPosting>,
    done: bool,
}

impl SearchStream<'_> {
    pub async fn next(&mut self) -> Option<SearchItem> {
        loop {
            if let Some(posting) = self.buffer.pop_front() {
                return Some(SearchItem::Posting(posting));
            }
            if self.done || self.page > self.scraper.config.max_pages {
                self.done = true;
                return None;
            }

            match self.scraper.fetch_page(&self.source, &self.query, self.page).await {
                Ok(postings) => {
                    self.page += 1;
                    self.buffer.extend(postings);
                }
                Err(failure) => {
                    self.done = true;
                    return Some(SearchItem::SourceFailed(failure));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceSelectors;
    use std::sync::Mutex;

    const LISTING: &str = r#"
        <html><body>
        <div class="card-content">
            <h2 class="title">Backend Engineer</h2>
            <h3 class="company">Acme</h3>
            <p class="location">Remote</p>
            <div class="content"><p>Build Rust services with PostgreSQL.</p></div>
            <a class="apply" href="https://boards.example/jobs/42">Apply</a>
        </div>
        <div class="card-content">
            <h2 class="title">Data Engineer</h2>
            <h3 class="company">Globex</h3>
            <p class="location">Berlin</p>
            <div class="content"><p>Pipelines and warehouses.</p></div>
            <a class="apply" href="https://boards.example/jobs/43">Apply</a>
        </div>
        </body></html>
    "#;

    /// Scripted fetcher: pops one canned response per call.
    struct ScriptedFetcher {
        responses: Mutex<VecDeque<Result<FetchedPage>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<FetchedPage>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }

        fn page(status: u16, body: &str) -> Result<FetchedPage> {
            Ok(FetchedPage {
                status,
                body: body.to_string(),
            })
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchedPage> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Self::page(200, "<html></html>"))
        }
    }

    fn fast_config() -> ScrapeConfig {
        ScrapeConfig {
            base_backoff_ms: 2,
            backoff_cap_ms: 10,
            max_fetch_attempts: 3,
            fetch_timeout_secs: 5,
            max_pages: 1,
        }
    }

    fn source(name: &str) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            search_url: "https://boards.example/jobs?q={query}&page={page}".to_string(),
            min_request_delay_ms: 0,
            selectors: SourceSelectors::default(),
            captcha_markers: vec!["captcha".to_string()],
            block_markers: vec!["unusual traffic".to_string()],
        }
    }

    async fn drain(stream: &mut SearchStream<'_>) -> Vec<SearchItem> {
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_search_parses_cards_into_postings() {
        let fetcher = ScriptedFetcher::new(vec![ScriptedFetcher::page(200, LISTING)]);
        let scraper = Scraper::new(fast_config(), fetcher.clone());
        let source = source("boards");

        let mut stream = scraper.search(&source, "rust engineer");
        let items = drain(&mut stream).await;

        assert_eq!(items.len(), 2);
        let SearchItem::Posting(first) = &items[0] else {
            panic!("expected posting");
        };
        assert_eq!(first.title, "Backend Engineer");
        assert_eq!(first.source_id.key(), "boards:42");
        assert_eq!(first.location, "Remote");
    }

    #[tokio::test]
    async fn test_captcha_aborts_source_without_retry() {
        let fetcher = ScriptedFetcher::new(vec![ScriptedFetcher::page(
            200,
            "<html>please solve this CAPTCHA to continue</html>",
        )]);
        let scraper = Scraper::new(fast_config(), fetcher.clone());
        let source = source("boards");

        let mut stream = scraper.search(&source, "rust");
        let items = drain(&mut stream).await;

        assert_eq!(items.len(), 1);
        let SearchItem::SourceFailed(failure) = &items[0] else {
            panic!("expected failure marker");
        };
        assert_eq!(failure.kind, ErrorKind::CaptchaBlocked);
        // No retry: a single fetch hit the wall and the stream ended.
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_retries_then_succeeds() {
        let fetcher = ScriptedFetcher::new(vec![
            ScriptedFetcher::page(429, ""),
            ScriptedFetcher::page(429, ""),
            ScriptedFetcher::page(200, LISTING),
        ]);
        let scraper = Scraper::new(fast_config(), fetcher.clone());
        let source = source("boards");

        let mut stream = scraper.search(&source, "rust");
        let items = drain(&mut stream).await;

        assert_eq!(fetcher.calls(), 3);
        assert!(matches!(items[0], SearchItem::Posting(_)));
    }

    #[tokio::test]
    async fn test_rate_limited_past_ceiling_fails_source() {
        let fetcher = ScriptedFetcher::new(vec![
            ScriptedFetcher::page(429, ""),
            ScriptedFetcher::page(429, ""),
            ScriptedFetcher::page(429, ""),
        ]);
        let scraper = Scraper::new(fast_config(), fetcher.clone());
        let source = source("boards");

        let mut stream = scraper.search(&source, "rust");
        let items = drain(&mut stream).await;

        assert_eq!(items.len(), 1);
        let SearchItem::SourceFailed(failure) = &items[0] else {
            panic!("expected failure marker");
        };
        assert_eq!(failure.kind, ErrorKind::RateLimited);
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_missing_fields_classify_as_structural_mismatch() {
        let fetcher = ScriptedFetcher::new(vec![ScriptedFetcher::page(
            200,
            r#"<div class="card-content"><h2 class="title">Engineer</h2></div>"#,
        )]);
        let scraper = Scraper::new(fast_config(), fetcher);
        let source = source("boards");

        let mut stream = scraper.search(&source, "rust");
        let items = drain(&mut stream).await;

        let SearchItem::SourceFailed(failure) = &items[0] else {
            panic!("expected failure marker");
        };
        assert_eq!(failure.kind, ErrorKind::StructuralMismatch);
        assert!(failure.detail.contains("selector"));
    }

    #[tokio::test]
    async fn test_transport_error_is_classified_distinctly() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(anyhow::anyhow!("connection reset")),
            Err(anyhow::anyhow!("connection reset")),
            Err(anyhow::anyhow!("connection reset")),
        ]);
        let scraper = Scraper::new(fast_config(), fetcher);
        let source = source("boards");

        let mut stream = scraper.search(&source, "rust");
        let items = drain(&mut stream).await;

        let SearchItem::SourceFailed(failure) = &items[0] else {
            panic!("expected failure marker");
        };
        assert_eq!(failure.kind, ErrorKind::TransportError);
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_bounded() {
        let config = ScrapeConfig {
            base_backoff_ms: 1000,
            backoff_cap_ms: 30_000,
            ..Default::default()
        };
        let mut last = 0;
        for attempt in 0..16 {
            let delay = raw_backoff_ms(&config, attempt);
            assert!(delay >= last, "attempt {attempt} decreased");
            assert!(delay <= config.backoff_cap_ms);
            last = delay;
        }
        assert_eq!(raw_backoff_ms(&config, 0), 1000);
        assert_eq!(raw_backoff_ms(&config, 2), 4000);
        assert_eq!(raw_backoff_ms(&config, 10), 30_000);
    }

    #[tokio::test]
    async fn test_rate_gate_spaces_same_source_requests() {
        let scraper = Scraper::new(fast_config(), ScriptedFetcher::new(vec![]));
        let start = Instant::now();
        scraper.wait_turn("boards", Duration::from_millis(40)).await;
        scraper.wait_turn("boards", Duration::from_millis(40)).await;
        assert!(start.elapsed() >= Duration::from_millis(35));

        // A different source is not held back by the first one's gate.
        let other_start = Instant::now();
        scraper.wait_turn("elsewhere", Duration::from_millis(40)).await;
        assert!(other_start.elapsed() < Duration::from_millis(35));
    }

    #[test]
    fn test_native_id_from_url_segment() {
        assert_eq!(native_id_from("https://x.example/jobs/42", "t", "c"), "42");
        assert_eq!(native_id_from("https://x.example/jobs/42/", "t", "c"), "42");
        assert_eq!(native_id_from("https://x.example/view?id=9", "t", "c"), "9");
        // No usable segment: falls back to a stable short hash.
        let a = native_id_from("https://x.example/", "Engineer", "Acme");
        let b = native_id_from("https://x.example/", "Engineer", "Acme");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
    }
}
