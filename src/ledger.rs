use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::models::{
    AttemptRecord, ErrorKind, JobPosting, JobRecord, JobState, MatchResult, PipelineError,
    record_key,
};
use crate::store::KvStore;

const JOB_PREFIX: &str = "job/";

/// Owns JobRecord lifecycles: deduplication, the state machine, and attempt
/// history. All mutations are read-modify-write under a per-record lock so
/// two concurrent cycles can never double-apply to the same job.
pub struct JobLedger {
    store: Arc<dyn KvStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobLedger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("ledger lock poisoned");
        locks.entry(key.to_string()).or_default().clone()
    }

    fn load(&self, key: &str) -> Result<Option<JobRecord>, PipelineError> {
        let raw = self
            .store
            .get(&format!("{JOB_PREFIX}{key}"))
            .map_err(PipelineError::Storage)?;
        match raw {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw)
                    .map_err(|e| PipelineError::Storage(anyhow::anyhow!("corrupt record {key}: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    fn save(&self, record: &JobRecord) -> Result<(), PipelineError> {
        let encoded = serde_json::to_string(record)
            .map_err(|e| PipelineError::Storage(anyhow::anyhow!("encode record: {e}")))?;
        self.store
            .put(&format!("{JOB_PREFIX}{}", record.dedup_key()), &encoded)
            .map_err(PipelineError::Storage)
    }

    /// Idempotent record of a scored posting for one profile version.
    ///
    /// If a record already exists for the dedup key, the match score and
    /// rationale are refreshed only when this discovery is newer, and the
    /// existing record is returned — never a duplicate. A posting whose
    /// description hash has drifted materially is recorded as a new posting
    /// under a drift-suffixed native id; the original stays untouched.
    pub fn record(
        &self,
        posting: JobPosting,
        profile_version: u32,
        match_result: &MatchResult,
    ) -> Result<JobRecord, PipelineError> {
        let key = record_key(profile_version, &posting.source_id);
        let guard = self.lock_for(&key);
        let _held = guard.lock().expect("record lock poisoned");

        if let Some(mut existing) = self.load(&key)? {
            if existing.posting.content_hash != posting.content_hash {
                drop(_held);
                let mut drifted = posting;
                let suffix: String = drifted.content_hash.chars().take(8).collect();
                drifted.source_id.native_id =
                    format!("{}#{}", drifted.source_id.native_id, suffix);
                tracing::info!(
                    source_id = %drifted.source_id,
                    "posting content drifted, recording as new posting"
                );
                return self.record(drifted, profile_version, match_result);
            }

            if posting.discovered_at > existing.posting.discovered_at {
                existing.match_score = match_result.score;
                existing.match_rationale = match_result.rationale.clone();
            }
            existing.posting.last_seen_at = posting.last_seen_at;
            self.save(&existing)?;
            tracing::debug!(key = %key, "posting already recorded, refreshed last_seen");
            return Ok(existing);
        }

        let mut record = JobRecord::new(posting, profile_version);
        record.match_score = match_result.score;
        record.match_rationale = match_result.rationale.clone();
        self.save(&record)?;
        tracing::info!(key = %key, score = record.match_score, "recorded new job");
        Ok(record)
    }

    /// Moves a record along one allowed edge. A request that is not in the
    /// transition table fails with `InvalidTransition` and leaves the stored
    /// state untouched; that is a caller bug and always propagates.
    pub fn transition(&self, key: &str, to: JobState) -> Result<JobRecord, PipelineError> {
        let guard = self.lock_for(key);
        let _held = guard.lock().expect("record lock poisoned");

        let mut record = self.load(key)?.ok_or_else(|| {
            PipelineError::Precondition(format!("no job record for key {key}"))
        })?;

        if !record.state.can_transition(to) {
            return Err(PipelineError::InvalidTransition {
                key: key.to_string(),
                from: record.state,
                to,
            });
        }

        let from = record.state;
        record.state = to;
        self.save(&record)?;
        tracing::info!(key = %key, %from, %to, "job state transition");
        Ok(record)
    }

    /// Appends one attempt to a record's history. Append-only: entries are
    /// never reordered or merged.
    pub fn append_attempt(
        &self,
        key: &str,
        attempt: AttemptRecord,
        last_error: Option<ErrorKind>,
    ) -> Result<JobRecord, PipelineError> {
        let guard = self.lock_for(key);
        let _held = guard.lock().expect("record lock poisoned");

        let mut record = self.load(key)?.ok_or_else(|| {
            PipelineError::Precondition(format!("no job record for key {key}"))
        })?;
        record.attempts.push(attempt);
        if last_error.is_some() {
            record.last_error = last_error;
        }
        self.save(&record)?;
        Ok(record)
    }

    /// Bumps `last_seen_at` for a re-sighted posting without touching match
    /// data or state.
    pub fn touch(
        &self,
        key: &str,
        last_seen_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<JobRecord, PipelineError> {
        let guard = self.lock_for(key);
        let _held = guard.lock().expect("record lock poisoned");

        let mut record = self.load(key)?.ok_or_else(|| {
            PipelineError::Precondition(format!("no job record for key {key}"))
        })?;
        record.posting.last_seen_at = last_seen_at;
        self.save(&record)?;
        Ok(record)
    }

    /// Overwrites the match score and rationale. Used by the resume pass,
    /// which re-scores records that were recorded but not yet decided.
    pub fn rescore(&self, key: &str, result: &MatchResult) -> Result<JobRecord, PipelineError> {
        let guard = self.lock_for(key);
        let _held = guard.lock().expect("record lock poisoned");

        let mut record = self.load(key)?.ok_or_else(|| {
            PipelineError::Precondition(format!("no job record for key {key}"))
        })?;
        record.match_score = result.score;
        record.match_rationale = result.rationale.clone();
        self.save(&record)?;
        Ok(record)
    }

    pub fn set_approved(&self, key: &str, approved: bool) -> Result<JobRecord, PipelineError> {
        let guard = self.lock_for(key);
        let _held = guard.lock().expect("record lock poisoned");

        let mut record = self.load(key)?.ok_or_else(|| {
            PipelineError::Precondition(format!("no job record for key {key}"))
        })?;
        record.approved = approved;
        self.save(&record)?;
        Ok(record)
    }

    pub fn get(&self, key: &str) -> Result<Option<JobRecord>, PipelineError> {
        let guard = self.lock_for(key);
        let _held = guard.lock().expect("record lock poisoned");
        self.load(key)
    }

    /// All records for a profile version in the given state, ordered by
    /// discovery time. Finite and restartable — used for resumption after a
    /// crash.
    pub fn list_by_state(
        &self,
        profile_version: u32,
        state: JobState,
    ) -> Result<Vec<JobRecord>, PipelineError> {
        let prefix = format!("{JOB_PREFIX}{profile_version}/");
        let keys = self.store.list_keys(&prefix).map_err(PipelineError::Storage)?;

        let mut records = Vec::new();
        for key in keys {
            let raw = self.store.get(&key).map_err(PipelineError::Storage)?;
            let Some(raw) = raw else { continue };
            let record: JobRecord = serde_json::from_str(&raw)
                .map_err(|e| PipelineError::Storage(anyhow::anyhow!("corrupt record {key}: {e}")))?;
            if record.state == state {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.posting.discovered_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptOutcome, MatchDecision, SourceId};
    use crate::store::MemoryStore;
    use chrono::{Duration, Utc};

    fn ledger() -> JobLedger {
        JobLedger::new(Arc::new(MemoryStore::new()))
    }

    fn posting(native_id: &str) -> JobPosting {
        JobPosting::new(
            SourceId::new("boards", native_id),
            "Backend Engineer",
            "Acme",
            "Remote",
            "Build and run Rust services.",
            "https://boards.example/apply/1",
        )
    }

    fn matched(score: f64) -> MatchResult {
        MatchResult {
            score,
            rationale: format!("scored {score}"),
            decision: MatchDecision::Matched,
        }
    }

    #[test]
    fn test_record_is_idempotent_per_dedup_key() {
        let ledger = ledger();

        let first = ledger.record(posting("7"), 1, &matched(0.8)).unwrap();
        let second = ledger.record(posting("7"), 1, &matched(0.5)).unwrap();

        assert_eq!(first.dedup_key(), second.dedup_key());
        let all: Vec<_> = ledger.list_by_state(1, JobState::Discovered).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_record_refreshes_score_only_when_newer() {
        let ledger = ledger();

        let mut early = posting("7");
        early.discovered_at = Utc::now() - Duration::hours(2);
        ledger.record(early.clone(), 1, &matched(0.8)).unwrap();

        // An older (same-time) re-discovery must not clobber the score.
        let stale = ledger.record(early, 1, &matched(0.2)).unwrap();
        assert!((stale.match_score - 0.8).abs() < f64::EPSILON);

        // A newer discovery refreshes it.
        let fresh = ledger.record(posting("7"), 1, &matched(0.9)).unwrap();
        assert!((fresh.match_score - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_same_source_different_profile_versions_are_distinct() {
        let ledger = ledger();
        ledger.record(posting("7"), 1, &matched(0.8)).unwrap();
        ledger.record(posting("7"), 2, &matched(0.8)).unwrap();
        assert_eq!(ledger.list_by_state(1, JobState::Discovered).unwrap().len(), 1);
        assert_eq!(ledger.list_by_state(2, JobState::Discovered).unwrap().len(), 1);
    }

    #[test]
    fn test_content_drift_records_new_posting() {
        let ledger = ledger();
        ledger.record(posting("7"), 1, &matched(0.8)).unwrap();

        let mut drifted = posting("7");
        drifted.description = "Completely different role description.".to_string();
        drifted.content_hash = crate::models::content_hash(&drifted.description);
        let record = ledger.record(drifted, 1, &matched(0.6)).unwrap();

        assert!(record.source_id.native_id.starts_with("7#"));
        assert_eq!(ledger.list_by_state(1, JobState::Discovered).unwrap().len(), 2);
    }

    #[test]
    fn test_transition_walks_allowed_edges() {
        let ledger = ledger();
        let record = ledger.record(posting("7"), 1, &matched(0.8)).unwrap();
        let key = record.dedup_key();

        let record = ledger.transition(&key, JobState::Matched).unwrap();
        assert_eq!(record.state, JobState::Matched);
        let record = ledger.transition(&key, JobState::Applying).unwrap();
        let record = ledger.transition(&record.dedup_key(), JobState::Applied).unwrap();
        assert_eq!(record.state, JobState::Applied);
    }

    #[test]
    fn test_invalid_transition_fails_and_preserves_state() {
        let ledger = ledger();
        let record = ledger.record(posting("7"), 1, &matched(0.8)).unwrap();
        let key = record.dedup_key();

        let err = ledger.transition(&key, JobState::Applied).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));

        // State unchanged on disk.
        let stored = ledger.get(&key).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Discovered);
    }

    #[test]
    fn test_transition_on_missing_record_is_precondition_error() {
        let ledger = ledger();
        let err = ledger.transition("1/boards:nope", JobState::Matched).unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
    }

    #[test]
    fn test_attempts_stay_ordered() {
        let ledger = ledger();
        let record = ledger.record(posting("7"), 1, &matched(0.8)).unwrap();
        let key = record.dedup_key();

        let base = Utc::now();
        for (i, outcome) in [
            AttemptOutcome::TransientError,
            AttemptOutcome::TransientError,
            AttemptOutcome::Success,
        ]
        .into_iter()
        .enumerate()
        {
            ledger
                .append_attempt(
                    &key,
                    AttemptRecord {
                        timestamp: base + Duration::seconds(i as i64),
                        outcome,
                        detail: format!("try {}", i + 1),
                    },
                    None,
                )
                .unwrap();
        }

        let stored = ledger.get(&key).unwrap().unwrap();
        assert_eq!(stored.attempts.len(), 3);
        assert_eq!(stored.attempts[0].detail, "try 1");
        assert_eq!(stored.attempts[2].outcome, AttemptOutcome::Success);
        assert!(stored.attempts.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_list_by_state_is_ordered_and_restartable() {
        let ledger = ledger();
        let mut older = posting("1");
        older.discovered_at = Utc::now() - Duration::hours(1);
        ledger.record(older, 1, &matched(0.7)).unwrap();
        ledger.record(posting("2"), 1, &matched(0.7)).unwrap();

        let first_pass = ledger.list_by_state(1, JobState::Discovered).unwrap();
        let second_pass = ledger.list_by_state(1, JobState::Discovered).unwrap();
        assert_eq!(first_pass.len(), 2);
        assert_eq!(first_pass[0].source_id.native_id, "1");
        assert_eq!(
            first_pass.iter().map(|r| r.dedup_key()).collect::<Vec<_>>(),
            second_pass.iter().map(|r| r.dedup_key()).collect::<Vec<_>>(),
        );
    }
}
