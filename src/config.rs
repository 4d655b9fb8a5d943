use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration. Everything tunable lives here; the pipeline never
/// hard-codes thresholds, delays, or selectors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub apply: ApplyConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Loads from the given path, or the default config location. A missing
    /// file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "pursuit") {
            Ok(proj_dirs.config_dir().join("config.json"))
        } else {
            Ok(PathBuf::from("pursuit.json"))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Score at or above which a posting is matched.
    #[serde(default = "default_matched_threshold")]
    pub matched_threshold: f64,
    /// Score at or above which (but below matched) a posting needs review.
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
    /// Score granted when both title and location preferences hit exactly,
    /// letting the rule layer match without a collaborator call.
    #[serde(default = "default_rule_match_score")]
    pub rule_match_score: f64,
    /// Posting descriptions are truncated to this many characters before
    /// being sent to the scorer.
    #[serde(default = "default_description_budget")]
    pub description_budget_chars: usize,
}

fn default_matched_threshold() -> f64 {
    0.6
}
fn default_review_threshold() -> f64 {
    0.35
}
fn default_rule_match_score() -> f64 {
    0.75
}
fn default_description_budget() -> usize {
    4000
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            matched_threshold: default_matched_threshold(),
            review_threshold: default_review_threshold(),
            rule_match_score: default_rule_match_score(),
            description_budget_chars: default_description_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// First backoff delay after a retryable fetch failure.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Backoff ceiling; the exponential curve never exceeds this.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Pages fetched per source per search before the stream ends.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_base_backoff_ms() -> u64 {
    1000
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_max_fetch_attempts() -> u32 {
    4
}
fn default_fetch_timeout_secs() -> u64 {
    20
}
fn default_max_pages() -> u32 {
    3
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_base_backoff_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_fetch_attempts: default_max_fetch_attempts(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_pages: default_max_pages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Failed tries allowed per job before the record is closed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Linear backoff between transient-error retries.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
    /// When false, matched jobs wait for an explicit approval before the
    /// attempter touches them.
    #[serde(default)]
    pub auto_apply: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_submit_timeout_secs() -> u64 {
    30
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            submit_timeout_secs: default_submit_timeout_secs(),
            auto_apply: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model() -> String {
    "api-sonnet".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    30
}
fn default_max_tokens() -> u32 {
    1024
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            timeout_secs: default_llm_timeout_secs(),
            max_tokens: default_max_tokens(),
        }
    }
}

// --- Sources ---

/// One job board. Selector values and challenge markers are configuration
/// data; the scraper core never embeds site specifics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Listing URL template with `{query}` and `{page}` placeholders.
    pub search_url: String,
    /// Minimum delay between requests to this source, enforced regardless of
    /// caller concurrency.
    #[serde(default = "default_min_request_delay_ms")]
    pub min_request_delay_ms: u64,
    #[serde(default)]
    pub selectors: SourceSelectors,
    #[serde(default = "default_captcha_markers")]
    pub captcha_markers: Vec<String>,
    #[serde(default = "default_block_markers")]
    pub block_markers: Vec<String>,
}

fn default_min_request_delay_ms() -> u64 {
    2000
}

fn default_captcha_markers() -> Vec<String> {
    vec![
        "captcha".to_string(),
        "are you a robot".to_string(),
        "challenge-form".to_string(),
    ]
}

fn default_block_markers() -> Vec<String> {
    vec![
        "unusual traffic".to_string(),
        "access denied".to_string(),
        "temporarily blocked".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSelectors {
    pub card: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    /// Anchor whose href is the apply URL; the card's id attribute is the
    /// native posting id.
    pub apply_link: String,
}

impl Default for SourceSelectors {
    fn default() -> Self {
        // Matches the common card layout of static demo boards.
        Self {
            card: ".card-content".to_string(),
            title: ".title".to_string(),
            company: ".company".to_string(),
            location: ".location".to_string(),
            description: ".content p".to_string(),
            apply_link: "a.apply".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert!(config.matching.review_threshold < config.matching.matched_threshold);
        assert!(config.matching.rule_match_score >= config.matching.matched_threshold);
        assert!(config.scrape.base_backoff_ms <= config.scrape.backoff_cap_ms);
        assert_eq!(config.apply.max_attempts, 3);
        assert!(!config.apply.auto_apply);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let raw = r#"{
            "matching": { "matched_threshold": 0.7 },
            "sources": [
                { "name": "boards", "search_url": "https://boards.example/jobs?q={query}&page={page}" }
            ]
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.matching.matched_threshold, 0.7);
        assert_eq!(config.matching.review_threshold, 0.35);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].min_request_delay_ms, 2000);
        assert!(!config.sources[0].captcha_markers.is_empty());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/pursuit.json"))).unwrap();
        assert_eq!(config.apply.max_attempts, 3);
        assert!(config.sources.is_empty());
    }
}
