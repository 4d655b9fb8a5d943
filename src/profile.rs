use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::ai::{self, AiProvider, ResumeAnalysis};
use crate::models::CandidateProfile;
use crate::store::{KvStore, ProfileStore};

/// Résumé-extraction collaborator: bytes in, plain text out. Upstream of
/// profile creation; richer formats live behind this seam.
pub trait ResumeExtractor: Send + Sync {
    fn extract_text(&self, bytes: &[u8], format: &str) -> Result<String>;
}

/// Extractor for text-based résumé formats.
pub struct PlainTextExtractor;

impl ResumeExtractor for PlainTextExtractor {
    fn extract_text(&self, bytes: &[u8], format: &str) -> Result<String> {
        match format {
            "txt" | "text" | "md" | "markdown" => {
                String::from_utf8(bytes.to_vec()).context("Resume is not valid UTF-8")
            }
            other => Err(anyhow!(
                "Unsupported resume format '{other}'. Supported: txt, md."
            )),
        }
    }
}

/// The always-asked clarification questions, with stable ids so confirmed
/// answers can feed structured preference fields.
const CORE_QUESTIONS: &[(&str, &str)] = &[
    ("titles", "What are your top desired job titles?"),
    ("locations", "Which locations work for you (including remote)?"),
    (
        "salary",
        "What are your salary expectations, if you're comfortable sharing?",
    ),
    ("musts", "Any must-have factors for your next role?"),
];

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileDraft {
    analysis: ResumeAnalysis,
    questions: Vec<(String, String)>,
    answers: BTreeMap<String, String>,
}

/// Builds candidate profiles: résumé ingestion, clarification Q&A, and the
/// confirm step that writes an immutable profile version.
pub struct ProfileBuilder {
    store: Arc<dyn KvStore>,
    provider: Option<Arc<dyn AiProvider>>,
    max_tokens: u32,
}

impl ProfileBuilder {
    pub fn new(
        store: Arc<dyn KvStore>,
        provider: Option<Arc<dyn AiProvider>>,
        max_tokens: u32,
    ) -> Self {
        Self {
            store,
            provider,
            max_tokens,
        }
    }

    fn draft_key(user_id: &str) -> String {
        format!("draft/{user_id}")
    }

    fn load_draft(&self, user_id: &str) -> Result<Option<ProfileDraft>> {
        match self.store.get(&Self::draft_key(user_id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save_draft(&self, user_id: &str, draft: &ProfileDraft) -> Result<()> {
        self.store
            .put(&Self::draft_key(user_id), &serde_json::to_string(draft)?)
    }

    /// Analyzes a résumé and opens a draft profile. Returns the clarification
    /// questions to put to the candidate: the stable core set plus up to two
    /// model-drafted extras when the collaborator is reachable.
    pub async fn ingest_resume(
        &self,
        user_id: &str,
        bytes: &[u8],
        format: &str,
        extractor: &dyn ResumeExtractor,
    ) -> Result<Vec<(String, String)>> {
        let text = extractor.extract_text(bytes, format)?;

        let analysis = match &self.provider {
            Some(provider) => match ai::analyze_resume(provider.as_ref(), &text, self.max_tokens).await {
                Ok(analysis) => analysis,
                Err(err) => {
                    tracing::warn!(error = %err, "resume analysis degraded to heuristic parse");
                    heuristic_analysis(&text)
                }
            },
            None => heuristic_analysis(&text),
        };

        let mut questions: Vec<(String, String)> = CORE_QUESTIONS
            .iter()
            .map(|(id, q)| (id.to_string(), q.to_string()))
            .collect();

        if let Some(provider) = &self.provider {
            match ai::clarification_questions(provider.as_ref(), &analysis, self.max_tokens).await {
                Ok(extra) => {
                    for (i, question) in extra.into_iter().take(2).enumerate() {
                        questions.push((format!("q{}", i + 1), question));
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "no extra clarification questions");
                }
            }
        }

        let draft = ProfileDraft {
            analysis,
            questions: questions.clone(),
            answers: BTreeMap::new(),
        };
        self.save_draft(user_id, &draft)?;
        tracing::info!(user = user_id, questions = questions.len(), "resume ingested");
        Ok(questions)
    }

    pub fn record_answer(&self, user_id: &str, question_id: &str, text: &str) -> Result<()> {
        let mut draft = self
            .load_draft(user_id)?
            .ok_or_else(|| anyhow!("No draft profile for '{user_id}'. Submit a resume first."))?;
        draft.answers.insert(question_id.to_string(), text.to_string());
        self.save_draft(user_id, &draft)
    }

    pub fn pending_questions(&self, user_id: &str) -> Result<Vec<(String, String)>> {
        let draft = self
            .load_draft(user_id)?
            .ok_or_else(|| anyhow!("No draft profile for '{user_id}'. Submit a resume first."))?;
        Ok(draft
            .questions
            .into_iter()
            .filter(|(id, _)| !draft.answers.contains_key(id))
            .collect())
    }

    /// Freezes the draft into the next immutable profile version. Structured
    /// preferences come from the core answers where given, otherwise from the
    /// résumé analysis.
    pub fn confirm(&self, user_id: &str) -> Result<CandidateProfile> {
        let draft = self
            .load_draft(user_id)?
            .ok_or_else(|| anyhow!("No draft profile for '{user_id}'. Submit a resume first."))?;

        let titles = match draft.answers.get("titles") {
            Some(answer) => split_list(answer),
            None => draft.analysis.titles.clone(),
        };
        let locations = match draft.answers.get("locations") {
            Some(answer) => split_list(answer),
            None => draft.analysis.locations.clone(),
        };
        let salary_floor = draft.answers.get("salary").and_then(|a| parse_salary(a));

        let profile = CandidateProfile {
            user_id: user_id.to_string(),
            version: 0,
            skills: draft
                .analysis
                .skills
                .iter()
                .map(|s| s.to_lowercase())
                .collect::<BTreeSet<_>>(),
            experience_years: draft.analysis.experience_years,
            preferred_titles: titles,
            preferred_locations: locations.into_iter().collect(),
            salary_floor,
            answers: draft.answers,
            summary: if draft.analysis.summary.is_empty() {
                None
            } else {
                Some(draft.analysis.summary)
            },
            confirmed_at: Utc::now(),
        };

        ProfileStore::new(self.store.as_ref()).save_version(profile)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Best-effort parse when the language model is unreachable: a "Skills:" line
/// and a "N years" mention are enough to keep the pipeline moving.
fn heuristic_analysis(text: &str) -> ResumeAnalysis {
    let mut analysis = ResumeAnalysis::default();

    for line in text.lines() {
        let trimmed = line.trim();
        let lowered = trimmed.to_lowercase();
        if lowered.starts_with("skills") {
            if let Some((_, rest)) = trimmed.split_once(':') {
                analysis.skills = split_list(rest);
            }
        }
    }

    let years_re = regex::Regex::new(r"(\d{1,2})\+?\s*years").expect("static regex");
    if let Some(caps) = years_re.captures(&text.to_lowercase()) {
        analysis.experience_years = caps[1].parse().unwrap_or(0.0);
    }

    analysis
}

/// Pulls a salary floor out of a free-text answer. "$120k", "$120,000" and
/// "120000" all work; values under 1000 are read as thousands.
fn parse_salary(answer: &str) -> Option<i64> {
    let mut digits = String::new();
    let mut suffix_k = false;

    for c in answer.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if c == ',' && !digits.is_empty() {
            continue;
        } else if !digits.is_empty() {
            suffix_k = matches!(c, 'k' | 'K');
            break;
        }
    }

    let value: i64 = digits.parse().ok()?;
    if suffix_k || value < 1000 {
        Some(value * 1000)
    } else {
        Some(value)
    }
}
