use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::ai::{AiProvider, LlmError, score_fit};
use crate::config::MatchingConfig;
use crate::models::{CandidateProfile, JobPosting, MatchDecision, MatchResult, PipelineError};

/// The semantic-scoring collaborator seam. The production implementation
/// calls the language model; tests plug in stubs.
#[async_trait]
pub trait FitScorer: Send + Sync {
    async fn score(
        &self,
        profile_summary: &str,
        posting_title: &str,
        posting_text: &str,
    ) -> Result<(f64, String), LlmError>;
}

pub struct LlmScorer {
    provider: std::sync::Arc<dyn AiProvider>,
    max_tokens: u32,
}

impl LlmScorer {
    pub fn new(provider: std::sync::Arc<dyn AiProvider>, max_tokens: u32) -> Self {
        Self { provider, max_tokens }
    }
}

#[async_trait]
impl FitScorer for LlmScorer {
    async fn score(
        &self,
        profile_summary: &str,
        posting_title: &str,
        posting_text: &str,
    ) -> Result<(f64, String), LlmError> {
        score_fit(
            self.provider.as_ref(),
            profile_summary,
            posting_title,
            posting_text,
            self.max_tokens,
        )
        .await
    }
}

/// Scores postings against a profile: deterministic rules first, then the
/// semantic scorer, with a skill-overlap fallback when the scorer is down.
pub struct Matcher {
    config: MatchingConfig,
    scorer: Option<Box<dyn FitScorer>>,
}

impl Matcher {
    pub fn new(config: MatchingConfig, scorer: Option<Box<dyn FitScorer>>) -> Self {
        Self { config, scorer }
    }

    pub async fn score(
        &self,
        profile: &CandidateProfile,
        posting: &JobPosting,
    ) -> Result<MatchResult, PipelineError> {
        // Rule layer: hard location and title constraints.
        let location_constrained = !profile.preferred_locations.is_empty();
        if location_constrained && !location_matches(profile, &posting.location) {
            return Ok(MatchResult {
                score: 0.0,
                rationale: format!("location '{}' not among preferred locations", posting.location),
                decision: MatchDecision::Rejected,
            });
        }

        let title_constrained = !profile.preferred_titles.is_empty();
        if title_constrained && !title_matches(profile, &posting.title) {
            return Ok(MatchResult {
                score: 0.0,
                rationale: format!("title '{}' matches no preferred title", posting.title),
                decision: MatchDecision::Rejected,
            });
        }

        // Both constraints present and satisfied: the rules alone are decisive
        // and the collaborator is not consulted.
        if location_constrained && title_constrained {
            return Ok(MatchResult {
                score: self.config.rule_match_score,
                rationale: "title and location match stated preferences".to_string(),
                decision: self.decide(self.config.rule_match_score),
            });
        }

        let budget = self.config.description_budget_chars;
        let truncated: String = posting.description.chars().take(budget).collect();
        let summary = profile.prompt_summary();

        let Some(scorer) = &self.scorer else {
            return Ok(self.fallback(profile, posting));
        };

        match scorer.score(&summary, &posting.title, &truncated).await {
            Ok((score, rationale)) => Ok(MatchResult {
                score,
                rationale,
                decision: self.decide(score),
            }),
            // Quota exhaustion pauses the whole cycle; it is not a per-job
            // failure and must not be absorbed here.
            Err(LlmError::QuotaExceeded(detail)) => Err(PipelineError::QuotaExceeded(detail)),
            Err(err) => {
                tracing::warn!(
                    source_id = %posting.source_id,
                    error = %err,
                    "semantic scorer unavailable, falling back to skill overlap"
                );
                Ok(self.fallback(profile, posting))
            }
        }
    }

    fn decide(&self, score: f64) -> MatchDecision {
        if score >= self.config.matched_threshold {
            MatchDecision::Matched
        } else if score >= self.config.review_threshold {
            MatchDecision::NeedsReview
        } else {
            MatchDecision::Rejected
        }
    }

    /// Skill-overlap heuristic used when the scorer fails or times out. The
    /// decision is always `NeedsReview`: an outage must never silently
    /// discard a potentially good match.
    fn fallback(&self, profile: &CandidateProfile, posting: &JobPosting) -> MatchResult {
        let score = skill_overlap(&profile.skills, &posting.description);
        MatchResult {
            score,
            rationale: format!(
                "semantic scorer unavailable; skill-overlap heuristic scored {score:.2}"
            ),
            decision: MatchDecision::NeedsReview,
        }
    }
}

fn location_matches(profile: &CandidateProfile, location: &str) -> bool {
    let location = location.to_lowercase();
    profile
        .preferred_locations
        .iter()
        .any(|preferred| location.contains(&preferred.to_lowercase()))
}

fn title_matches(profile: &CandidateProfile, title: &str) -> bool {
    let title = title.to_lowercase();
    profile
        .preferred_titles
        .iter()
        .any(|preferred| title.contains(&preferred.to_lowercase()))
}

/// Jaccard similarity between the profile's skills and the terms extracted
/// from the posting text. A skill counts as present on an exact term match or
/// a close fuzzy match (catches "postgres" vs "postgresql").
pub fn skill_overlap(skills: &BTreeSet<String>, posting_text: &str) -> f64 {
    if skills.is_empty() {
        return 0.0;
    }

    let terms = extract_terms(posting_text);
    if terms.is_empty() {
        return 0.0;
    }

    let matched = skills
        .iter()
        .filter(|skill| {
            let skill = skill.to_lowercase();
            terms
                .iter()
                .any(|term| *term == skill || strsim::jaro_winkler(term, &skill) > 0.92)
        })
        .count();

    let union = skills.len() + terms.len() - matched;
    matched as f64 / union as f64
}

fn extract_terms(text: &str) -> BTreeSet<String> {
    let re = regex::Regex::new(r"[A-Za-z][A-Za-z0-9+#.]+").expect("static regex");
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches('.').to_lowercase())
        .filter(|t| t.len() > 1)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceId;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn profile(titles: &[&str], locations: &[&str]) -> CandidateProfile {
        CandidateProfile {
            user_id: "casey".to_string(),
            version: 1,
            skills: BTreeSet::from(["rust".to_string(), "postgresql".to_string()]),
            experience_years: 6.0,
            preferred_titles: titles.iter().map(|s| s.to_string()).collect(),
            preferred_locations: locations.iter().map(|s| s.to_string()).collect(),
            salary_floor: None,
            answers: BTreeMap::new(),
            summary: None,
            confirmed_at: Utc::now(),
        }
    }

    fn posting(title: &str, location: &str, description: &str) -> JobPosting {
        JobPosting::new(
            SourceId::new("boards", "1"),
            title,
            "Acme",
            location,
            description,
            "https://boards.example/apply/1",
        )
    }

    struct StubScorer {
        result: Result<(f64, String), LlmError>,
    }

    impl StubScorer {
        fn ok(score: f64) -> Box<Self> {
            Box::new(Self {
                result: Ok((score, "stub rationale".to_string())),
            })
        }

        fn err(err: LlmError) -> Box<Self> {
            Box::new(Self { result: Err(err) })
        }
    }

    #[async_trait]
    impl FitScorer for StubScorer {
        async fn score(
            &self,
            _profile_summary: &str,
            _posting_title: &str,
            _posting_text: &str,
        ) -> Result<(f64, String), LlmError> {
            match &self.result {
                Ok(v) => Ok(v.clone()),
                Err(LlmError::Timeout(s)) => Err(LlmError::Timeout(*s)),
                Err(LlmError::QuotaExceeded(d)) => Err(LlmError::QuotaExceeded(d.clone())),
                Err(e) => Err(LlmError::Transport(e.to_string())),
            }
        }
    }

    /// A scorer that must never be called.
    struct PanicScorer;

    #[async_trait]
    impl FitScorer for PanicScorer {
        async fn score(&self, _: &str, _: &str, _: &str) -> Result<(f64, String), LlmError> {
            panic!("scorer must not be consulted");
        }
    }

    #[tokio::test]
    async fn test_location_constraint_rejects() {
        let matcher = Matcher::new(MatchingConfig::default(), Some(StubScorer::ok(0.9)));
        let result = matcher
            .score(
                &profile(&["Engineer"], &["Remote"]),
                &posting("Backend Engineer", "New York, NY", "Rust services."),
            )
            .await
            .unwrap();
        assert_eq!(result.decision, MatchDecision::Rejected);
        assert!(result.rationale.contains("location"));
    }

    #[tokio::test]
    async fn test_title_constraint_rejects() {
        let matcher = Matcher::new(MatchingConfig::default(), Some(StubScorer::ok(0.9)));
        let result = matcher
            .score(
                &profile(&["Data Scientist"], &["Remote"]),
                &posting("Backend Engineer", "Remote", "Rust services."),
            )
            .await
            .unwrap();
        assert_eq!(result.decision, MatchDecision::Rejected);
    }

    #[tokio::test]
    async fn test_rule_layer_matches_without_collaborator() {
        // Both preference constraints hit; no scorer needed.
        let matcher = Matcher::new(MatchingConfig::default(), Some(Box::new(PanicScorer)));
        let result = matcher
            .score(
                &profile(&["Engineer"], &["Remote"]),
                &posting("Backend Engineer", "Remote", "Rust services."),
            )
            .await
            .unwrap();
        assert_eq!(result.decision, MatchDecision::Matched);
        assert!((result.score - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_empty_constraints_defer_to_scorer() {
        let matcher = Matcher::new(MatchingConfig::default(), Some(StubScorer::ok(0.9)));
        let result = matcher
            .score(
                &profile(&[], &[]),
                &posting("Backend Engineer", "Remote", "Rust services."),
            )
            .await
            .unwrap();
        assert_eq!(result.decision, MatchDecision::Matched);
        assert_eq!(result.rationale, "stub rationale");
    }

    #[tokio::test]
    async fn test_threshold_bands() {
        for (score, expected) in [
            (0.9, MatchDecision::Matched),
            (0.6, MatchDecision::Matched),
            (0.5, MatchDecision::NeedsReview),
            (0.35, MatchDecision::NeedsReview),
            (0.2, MatchDecision::Rejected),
        ] {
            let matcher = Matcher::new(MatchingConfig::default(), Some(StubScorer::ok(score)));
            let result = matcher
                .score(
                    &profile(&[], &[]),
                    &posting("Backend Engineer", "Remote", "Rust services."),
                )
                .await
                .unwrap();
            assert_eq!(result.decision, expected, "score {score}");
        }
    }

    #[tokio::test]
    async fn test_scorer_timeout_yields_needs_review_never_rejected() {
        let matcher = Matcher::new(
            MatchingConfig::default(),
            Some(StubScorer::err(LlmError::Timeout(30))),
        );
        let result = matcher
            .score(
                &profile(&[], &[]),
                &posting("Backend Engineer", "Remote", "Nothing in common here."),
            )
            .await
            .unwrap();
        assert_eq!(result.decision, MatchDecision::NeedsReview);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_propagates() {
        let matcher = Matcher::new(
            MatchingConfig::default(),
            Some(StubScorer::err(LlmError::QuotaExceeded("hard limit".to_string()))),
        );
        let err = matcher
            .score(
                &profile(&[], &[]),
                &posting("Backend Engineer", "Remote", "Rust services."),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::QuotaExceeded(_)));
    }

    #[test]
    fn test_skill_overlap_counts_fuzzy_matches() {
        let skills = BTreeSet::from(["rust".to_string(), "postgresql".to_string()]);
        let with_overlap = skill_overlap(&skills, "We use Rust and Postgresql daily");
        let without = skill_overlap(&skills, "We use COBOL on mainframes");
        assert!(with_overlap > without);
        assert!(with_overlap > 0.0);
        assert_eq!(skill_overlap(&BTreeSet::new(), "anything"), 0.0);
    }
}
