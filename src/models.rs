use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// --- Candidate profile ---

/// A confirmed candidate profile. Immutable once confirmed; preference edits
/// produce a new version so application history stays auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub user_id: String,
    pub version: u32,
    pub skills: BTreeSet<String>,
    pub experience_years: f64,
    pub preferred_titles: Vec<String>,
    pub preferred_locations: BTreeSet<String>,
    pub salary_floor: Option<i64>,
    /// Free-text answers to clarification questions, keyed by question id.
    pub answers: BTreeMap<String, String>,
    pub summary: Option<String>,
    pub confirmed_at: DateTime<Utc>,
}

impl CandidateProfile {
    /// Compact one-paragraph summary fed to the scoring prompt.
    pub fn prompt_summary(&self) -> String {
        let skills: Vec<&str> = self.skills.iter().map(String::as_str).collect();
        let mut out = format!(
            "Skills: {}. Experience: {:.0} years.",
            skills.join(", "),
            self.experience_years
        );
        if !self.preferred_titles.is_empty() {
            out.push_str(&format!(" Target roles: {}.", self.preferred_titles.join(", ")));
        }
        if let Some(summary) = &self.summary {
            out.push(' ');
            out.push_str(summary);
        }
        out
    }
}

// --- Job postings ---

/// Source name plus the site-native identifier. Together these form the
/// global dedup key for a posting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    pub source: String,
    pub native_id: String,
}

impl SourceId {
    pub fn new(source: impl Into<String>, native_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            native_id: native_id.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.source, self.native_id)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.native_id)
    }
}

/// One scraped job posting. Immutable once recorded; re-scraping the same
/// source id only bumps `last_seen_at` unless the description hash drifts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPosting {
    pub source_id: SourceId,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub apply_url: String,
    pub discovered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub content_hash: String,
}

impl JobPosting {
    pub fn new(
        source_id: SourceId,
        title: impl Into<String>,
        company: impl Into<String>,
        location: impl Into<String>,
        description: impl Into<String>,
        apply_url: impl Into<String>,
    ) -> Self {
        let description = description.into();
        let now = Utc::now();
        Self {
            source_id,
            title: title.into(),
            company: company.into(),
            location: location.into(),
            content_hash: content_hash(&description),
            description,
            apply_url: apply_url.into(),
            discovered_at: now,
            last_seen_at: now,
        }
    }
}

/// Hash of the normalized description, used to detect material content drift.
pub fn content_hash(content: &str) -> String {
    let normalized: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(normalized.join("\n").as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// --- Job record state machine ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Discovered,
    Matched,
    Rejected,
    NeedsReview,
    Applying,
    Applied,
    ApplicationFailed,
    Interviewing,
    RejectedBySite,
    Closed,
}

/// The full set of legal (from, to) edges. Anything not listed here is an
/// `InvalidTransition`.
pub const ALLOWED_TRANSITIONS: &[(JobState, JobState)] = &[
    (JobState::Discovered, JobState::Matched),
    (JobState::Discovered, JobState::Rejected),
    (JobState::Discovered, JobState::NeedsReview),
    (JobState::Discovered, JobState::Closed),
    (JobState::NeedsReview, JobState::Matched),
    (JobState::NeedsReview, JobState::Rejected),
    (JobState::NeedsReview, JobState::Closed),
    (JobState::Matched, JobState::Applying),
    (JobState::Matched, JobState::Closed),
    (JobState::Applying, JobState::Applied),
    (JobState::Applying, JobState::ApplicationFailed),
    (JobState::Applying, JobState::Closed),
    (JobState::ApplicationFailed, JobState::Applying),
    (JobState::ApplicationFailed, JobState::Closed),
    (JobState::Applied, JobState::Interviewing),
    (JobState::Applied, JobState::RejectedBySite),
    (JobState::Applied, JobState::Closed),
    (JobState::Interviewing, JobState::Closed),
    (JobState::RejectedBySite, JobState::Closed),
];

impl JobState {
    pub const fn label(self) -> &'static str {
        match self {
            JobState::Discovered => "discovered",
            JobState::Matched => "matched",
            JobState::Rejected => "rejected",
            JobState::NeedsReview => "needs_review",
            JobState::Applying => "applying",
            JobState::Applied => "applied",
            JobState::ApplicationFailed => "application_failed",
            JobState::Interviewing => "interviewing",
            JobState::RejectedBySite => "rejected_by_site",
            JobState::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<JobState> {
        let all = [
            JobState::Discovered,
            JobState::Matched,
            JobState::Rejected,
            JobState::NeedsReview,
            JobState::Applying,
            JobState::Applied,
            JobState::ApplicationFailed,
            JobState::Interviewing,
            JobState::RejectedBySite,
            JobState::Closed,
        ];
        all.into_iter().find(|state| state.label() == s)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, JobState::Rejected | JobState::Closed)
    }

    pub fn can_transition(self, to: JobState) -> bool {
        ALLOWED_TRANSITIONS.contains(&(self, to))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// --- Match results ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Matched,
    Rejected,
    NeedsReview,
}

impl MatchDecision {
    pub const fn target_state(self) -> JobState {
        match self {
            MatchDecision::Matched => JobState::Matched,
            MatchDecision::Rejected => JobState::Rejected,
            MatchDecision::NeedsReview => JobState::NeedsReview,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub score: f64,
    pub rationale: String,
    pub decision: MatchDecision,
}

// --- Attempts ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    CaptchaBlocked,
    FormMismatch,
    TransientError,
    RejectedBySite,
}

impl AttemptOutcome {
    pub const fn label(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::CaptchaBlocked => "captcha_blocked",
            AttemptOutcome::FormMismatch => "form_mismatch",
            AttemptOutcome::TransientError => "transient_error",
            AttemptOutcome::RejectedBySite => "rejected_by_site",
        }
    }
}

/// Append-only record of one application try. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub detail: String,
}

// --- Failure classification (recorded as data, not raised) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    CaptchaBlocked,
    StructuralMismatch,
    TransportError,
    QuotaExceeded,
}

impl ErrorKind {
    pub const fn label(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::CaptchaBlocked => "captcha_blocked",
            ErrorKind::StructuralMismatch => "structural_mismatch",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::QuotaExceeded => "quota_exceeded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// --- The ledger's central entity ---

/// One posting tracked for one profile version. At most one record exists per
/// (source id, profile version) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub source_id: SourceId,
    pub profile_version: u32,
    pub posting: JobPosting,
    pub state: JobState,
    pub match_score: f64,
    pub match_rationale: String,
    pub approved: bool,
    pub attempts: Vec<AttemptRecord>,
    pub last_error: Option<ErrorKind>,
}

impl JobRecord {
    pub fn new(posting: JobPosting, profile_version: u32) -> Self {
        Self {
            source_id: posting.source_id.clone(),
            profile_version,
            posting,
            state: JobState::Discovered,
            match_score: 0.0,
            match_rationale: String::new(),
            approved: false,
            attempts: Vec::new(),
            last_error: None,
        }
    }

    /// Dedup key: (source id, profile version).
    pub fn dedup_key(&self) -> String {
        record_key(self.profile_version, &self.source_id)
    }

    /// Count of failed tries recorded so far.
    pub fn failed_attempts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.outcome != AttemptOutcome::Success)
            .count()
    }
}

pub fn record_key(profile_version: u32, source_id: &SourceId) -> String {
    format!("{}/{}", profile_version, source_id.key())
}

// --- Contract errors ---

/// Fatal caller-contract failures. These indicate an orchestration bug and
/// always propagate; per-job failures travel as `ErrorKind` data instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid transition {from} -> {to} for job {key}")]
    InvalidTransition {
        key: String,
        from: JobState,
        to: JobState,
    },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("language-model quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("storage failure: {0}")]
    Storage(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posting(id: &str) -> JobPosting {
        JobPosting::new(
            SourceId::new("boards", id),
            "Backend Engineer",
            "Acme",
            "Remote",
            "Build services in Rust.",
            "https://boards.example/apply/1",
        )
    }

    #[test]
    fn test_transition_table_forward_only() {
        assert!(JobState::Discovered.can_transition(JobState::Matched));
        assert!(JobState::Matched.can_transition(JobState::Applying));
        assert!(JobState::Applying.can_transition(JobState::Applied));

        // No skipping a defined predecessor.
        assert!(!JobState::Discovered.can_transition(JobState::Applying));
        assert!(!JobState::Discovered.can_transition(JobState::Applied));
        assert!(!JobState::Matched.can_transition(JobState::Applied));

        // No going backward.
        assert!(!JobState::Applied.can_transition(JobState::Matched));
        assert!(!JobState::Applying.can_transition(JobState::Matched));
    }

    #[test]
    fn test_terminal_states_have_no_edges() {
        for state in [JobState::Rejected, JobState::Closed] {
            assert!(state.is_terminal());
            for (from, _) in ALLOWED_TRANSITIONS {
                assert_ne!(*from, state, "{state} must not appear as an edge source");
            }
        }
    }

    #[test]
    fn test_needs_review_promotion_edges() {
        assert!(JobState::NeedsReview.can_transition(JobState::Matched));
        assert!(JobState::NeedsReview.can_transition(JobState::Rejected));
        assert!(!JobState::NeedsReview.can_transition(JobState::Applying));
    }

    #[test]
    fn test_every_non_terminal_state_can_close() {
        let non_terminal = [
            JobState::Discovered,
            JobState::Matched,
            JobState::NeedsReview,
            JobState::Applying,
            JobState::Applied,
            JobState::ApplicationFailed,
            JobState::Interviewing,
            JobState::RejectedBySite,
        ];
        for state in non_terminal {
            assert!(state.can_transition(JobState::Closed), "{state} -> closed");
        }
    }

    #[test]
    fn test_state_label_round_trip() {
        for (from, to) in ALLOWED_TRANSITIONS {
            assert_eq!(JobState::parse(from.label()), Some(*from));
            assert_eq!(JobState::parse(to.label()), Some(*to));
        }
        assert_eq!(JobState::parse("interviewing"), Some(JobState::Interviewing));
        assert_eq!(JobState::parse("nonsense"), None);
    }

    #[test]
    fn test_content_hash_ignores_whitespace_noise() {
        let a = content_hash("Build services.\n\n  Ship them.  ");
        let b = content_hash("Build services.\nShip them.");
        let c = content_hash("Build different things.");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_record_dedup_key_includes_profile_version() {
        let record = JobRecord::new(posting("42"), 3);
        assert_eq!(record.dedup_key(), "3/boards:42");
    }

    #[test]
    fn test_failed_attempts_excludes_success() {
        let mut record = JobRecord::new(posting("42"), 1);
        for outcome in [
            AttemptOutcome::TransientError,
            AttemptOutcome::TransientError,
            AttemptOutcome::Success,
        ] {
            record.attempts.push(AttemptRecord {
                timestamp: Utc::now(),
                outcome,
                detail: String::new(),
            });
        }
        assert_eq!(record.failed_attempts(), 2);
    }
}
