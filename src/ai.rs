use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Failures of the language-model collaborator. Quota exhaustion is distinct
/// from everything else because it pauses the pipeline instead of degrading a
/// single call.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("language-model call timed out after {0}s")]
    Timeout(u64),

    #[error("language-model quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("language-model transport failure: {0}")]
    Transport(String),

    #[error("language-model API returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("language-model response unusable: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

pub fn resolve_model(name: &str) -> anyhow::Result<ModelSpec> {
    match name {
        // Anthropic API (requires ANTHROPIC_API_KEY)
        "api-sonnet" | "sonnet" => Ok(ModelSpec {
            provider: ProviderKind::Anthropic,
            model_id: "claude-sonnet-4-5-20250929".to_string(),
            short_name: "api-sonnet".to_string(),
        }),
        "api-haiku" | "haiku" => Ok(ModelSpec {
            provider: ProviderKind::Anthropic,
            model_id: "claude-haiku-4-5-20251001".to_string(),
            short_name: "api-haiku".to_string(),
        }),
        // OpenAI (requires OPENAI_API_KEY)
        "gpt-4o" => Ok(ModelSpec {
            provider: ProviderKind::OpenAI,
            model_id: "gpt-4o".to_string(),
            short_name: "gpt-4o".to_string(),
        }),
        "gpt-4o-mini" => Ok(ModelSpec {
            provider: ProviderKind::OpenAI,
            model_id: "gpt-4o-mini".to_string(),
            short_name: "gpt-4o-mini".to_string(),
        }),
        _ => Err(anyhow::anyhow!(
            "Unknown model '{}'. Available: api-sonnet (default), api-haiku, gpt-4o, gpt-4o-mini",
            name
        )),
    }
}

pub fn create_provider(spec: &ModelSpec, timeout_secs: u64) -> anyhow::Result<Box<dyn AiProvider>> {
    match spec.provider {
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(
            spec.model_id.clone(),
            timeout_secs,
        )?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAIProvider::new(
            spec.model_id.clone(),
            timeout_secs,
        )?)),
    }
}

fn classify_response(status: u16, body: String) -> LlmError {
    if status == 429 {
        LlmError::QuotaExceeded(body)
    } else {
        LlmError::Api { status, body }
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String, timeout_secs: u64) -> anyhow::Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY").map_err(|_| {
            anyhow::anyhow!(
                "ANTHROPIC_API_KEY environment variable not set. Set it with: export ANTHROPIC_API_KEY=your-key-here"
            )
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;
        Ok(Self {
            api_key,
            model_id,
            timeout_secs,
            client,
        })
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let request = AnthropicRequest {
            model: self.model_id.clone(),
            max_tokens,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout_secs)
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status.as_u16(), body));
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(format!("Bad Anthropic response: {e}")))?;

        api_response
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| LlmError::Malformed("No content in Anthropic response".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<OpenAIMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug)]
pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(model_id: String, timeout_secs: u64) -> anyhow::Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| {
            anyhow::anyhow!(
                "OPENAI_API_KEY environment variable not set. Set it with: export OPENAI_API_KEY=your-key-here"
            )
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;
        Ok(Self {
            api_key,
            model_id,
            timeout_secs,
            client,
        })
    }
}

#[async_trait]
impl AiProvider for OpenAIProvider {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let request = OpenAIRequest {
            model: self.model_id.clone(),
            max_tokens,
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout_secs)
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status.as_u16(), body));
        }

        let api_response: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(format!("Bad OpenAI response: {e}")))?;

        api_response
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .ok_or_else(|| LlmError::Malformed("No choices in OpenAI response".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Prompt builders and response parsers ---

/// Scores a posting against a profile summary. The model answers in a fixed
/// two-line format; anything else is `Malformed`.
pub async fn score_fit(
    provider: &dyn AiProvider,
    profile_summary: &str,
    posting_title: &str,
    posting_text: &str,
    max_tokens: u32,
) -> Result<(f64, String), LlmError> {
    let prompt = format!(
        "Assess how well this candidate fits the job posting.\n\
        Return EXACTLY two lines in this format with no other text:\n\
        SCORE: <number between 0.0 and 1.0>\n\
        RATIONALE: <one or two sentences naming the key matching factors or gaps>\n\n\
        Candidate:\n{profile_summary}\n\n\
        Job Title: {posting_title}\n\n\
        Job Posting:\n{posting_text}"
    );

    let response = provider.complete(&prompt, max_tokens).await?;
    parse_fit_response(&response)
}

pub(crate) fn parse_fit_response(response: &str) -> Result<(f64, String), LlmError> {
    let mut score = None;
    let mut rationale = String::new();

    for line in response.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("SCORE:") {
            score = rest.trim().parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("RATIONALE:") {
            rationale = rest.trim().to_string();
        }
    }

    match score {
        Some(s) if (0.0..=1.0).contains(&s) && !rationale.is_empty() => Ok((s, rationale)),
        Some(s) => Err(LlmError::Malformed(format!("fit score out of range or missing rationale: {s}"))),
        None => Err(LlmError::Malformed(format!(
            "no SCORE line in response: {}",
            response.chars().take(200).collect::<String>()
        ))),
    }
}

/// Structured facts extracted from a résumé.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeAnalysis {
    pub skills: Vec<String>,
    pub experience_years: f64,
    pub titles: Vec<String>,
    pub locations: Vec<String>,
    pub summary: String,
}

pub async fn analyze_resume(
    provider: &dyn AiProvider,
    resume_text: &str,
    max_tokens: u32,
) -> Result<ResumeAnalysis, LlmError> {
    let prompt = format!(
        "Analyze this resume and extract the candidate's profile.\n\
        Return EXACTLY in this format with no other text:\n\
        SKILLS: skill1, skill2, skill3\n\
        EXPERIENCE_YEARS: <number>\n\
        TITLES: title1, title2\n\
        LOCATIONS: location1, location2\n\
        SUMMARY: <one-sentence professional summary>\n\n\
        Resume:\n{resume_text}"
    );

    let response = provider.complete(&prompt, max_tokens).await?;
    Ok(parse_resume_response(&response))
}

pub(crate) fn parse_resume_response(response: &str) -> ResumeAnalysis {
    let mut analysis = ResumeAnalysis::default();
    for line in response.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("SKILLS:") {
            analysis.skills = split_list(rest);
        } else if let Some(rest) = line.strip_prefix("EXPERIENCE_YEARS:") {
            analysis.experience_years = rest.trim().parse().unwrap_or(0.0);
        } else if let Some(rest) = line.strip_prefix("TITLES:") {
            analysis.titles = split_list(rest);
        } else if let Some(rest) = line.strip_prefix("LOCATIONS:") {
            analysis.locations = split_list(rest);
        } else if let Some(rest) = line.strip_prefix("SUMMARY:") {
            analysis.summary = rest.trim().to_string();
        }
    }
    analysis
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Drafts preference-clarification questions from a résumé analysis. One
/// question per line, dash-prefixed.
pub async fn clarification_questions(
    provider: &dyn AiProvider,
    analysis: &ResumeAnalysis,
    max_tokens: u32,
) -> Result<Vec<String>, LlmError> {
    let prompt = format!(
        "A candidate has these skills: {}. Experience: {:.0} years. Past titles: {}.\n\
        Write up to 6 short questions that clarify their job-search preferences \
        (desired roles, locations or remote work, salary expectations asked sensitively, must-have factors).\n\
        Return one question per line, each starting with '- ', and nothing else.",
        analysis.skills.join(", "),
        analysis.experience_years,
        analysis.titles.join(", "),
    );

    let response = provider.complete(&prompt, max_tokens).await?;
    let questions: Vec<String> = response
        .lines()
        .filter_map(|line| line.trim().strip_prefix("- "))
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();

    if questions.is_empty() {
        return Err(LlmError::Malformed("no questions in response".to_string()));
    }
    Ok(questions)
}

/// Drafts a short answer for a custom application question, grounded in the
/// candidate's profile. Used by the attempter; failures degrade, they never
/// fail the attempt.
pub async fn draft_answer(
    provider: &dyn AiProvider,
    profile_summary: &str,
    posting_title: &str,
    question: &str,
    max_tokens: u32,
) -> Result<String, LlmError> {
    let prompt = format!(
        "You are answering an application question on behalf of a candidate. \
        Write 2-3 truthful sentences grounded ONLY in the candidate facts below.\n\n\
        Candidate:\n{profile_summary}\n\n\
        Role: {posting_title}\n\
        Question: {question}\n\n\
        Answer:"
    );

    let response = provider.complete(&prompt, max_tokens).await?;
    let answer = response.trim().to_string();
    if answer.is_empty() {
        return Err(LlmError::Malformed("empty answer draft".to_string()));
    }
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_model_anthropic() {
        let spec = resolve_model("api-sonnet").unwrap();
        assert_eq!(spec.model_id, "claude-sonnet-4-5-20250929");
        assert!(matches!(spec.provider, ProviderKind::Anthropic));

        let spec = resolve_model("haiku").unwrap();
        assert_eq!(spec.short_name, "api-haiku");
    }

    #[test]
    fn test_resolve_model_openai() {
        let spec = resolve_model("gpt-4o").unwrap();
        assert!(matches!(spec.provider, ProviderKind::OpenAI));
    }

    #[test]
    fn test_resolve_model_unknown() {
        assert!(resolve_model("gpt-3").is_err());
    }

    #[test]
    fn test_parse_fit_response() {
        let (score, rationale) =
            parse_fit_response("SCORE: 0.82\nRATIONALE: Strong Rust and systems background.")
                .unwrap();
        assert!((score - 0.82).abs() < f64::EPSILON);
        assert!(rationale.contains("Rust"));
    }

    #[test]
    fn test_parse_fit_response_rejects_out_of_range() {
        assert!(parse_fit_response("SCORE: 7\nRATIONALE: ok").is_err());
        assert!(parse_fit_response("The fit looks decent overall.").is_err());
    }

    #[test]
    fn test_parse_resume_response() {
        let analysis = parse_resume_response(
            "SKILLS: Rust, PostgreSQL, Kubernetes\n\
             EXPERIENCE_YEARS: 7\n\
             TITLES: Backend Engineer, Platform Engineer\n\
             LOCATIONS: Remote, Berlin\n\
             SUMMARY: Backend engineer focused on data infrastructure.",
        );
        assert_eq!(analysis.skills.len(), 3);
        assert_eq!(analysis.experience_years, 7.0);
        assert_eq!(analysis.titles[1], "Platform Engineer");
        assert_eq!(analysis.locations, vec!["Remote", "Berlin"]);
        assert!(analysis.summary.starts_with("Backend engineer"));
    }

    #[test]
    fn test_quota_classification() {
        assert!(matches!(
            classify_response(429, "rate limit".to_string()),
            LlmError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_response(500, "oops".to_string()),
            LlmError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn test_anthropic_provider_requires_api_key() {
        let original = env::var("ANTHROPIC_API_KEY").ok();
        unsafe {
            env::remove_var("ANTHROPIC_API_KEY");
        }

        let result = AnthropicProvider::new("claude-sonnet-4-5-20250929".to_string(), 30);

        if let Some(val) = original {
            unsafe {
                env::set_var("ANTHROPIC_API_KEY", val);
            }
        }

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("ANTHROPIC_API_KEY"));
    }
}
