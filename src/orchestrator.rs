use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::attempter::Attempter;
use crate::config::Config;
use crate::ledger::JobLedger;
use crate::matcher::Matcher;
use crate::models::{
    AttemptOutcome, CandidateProfile, JobPosting, JobState, MatchDecision, MatchResult,
    PipelineError, SourceId, record_key,
};
use crate::notify::{CycleSummary, Notifier};
use crate::scraper::{Scraper, SearchItem};

/// Cooperative cancellation signal. Checked between postings and between
/// attempts, never mid-attempt, so a submission in flight is always finished.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives one full cycle per profile version: scrape, score, record, attempt,
/// report. Crashing mid-cycle leaves the ledger consistent; a rerun picks up
/// where the last one stopped.
pub struct Orchestrator {
    config: Config,
    scraper: Scraper,
    matcher: Matcher,
    ledger: JobLedger,
    attempter: Attempter,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        scraper: Scraper,
        matcher: Matcher,
        ledger: JobLedger,
        attempter: Attempter,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            scraper,
            matcher,
            ledger,
            attempter,
            notifier,
        }
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub async fn run_cycle(
        &self,
        profile: &CandidateProfile,
        query: &str,
        cancel: &CancelFlag,
    ) -> Result<CycleSummary, PipelineError> {
        let mut summary = CycleSummary::default();
        tracing::info!(user = %profile.user_id, version = profile.version, %query, "cycle started");

        // Records left undecided by a crash or quota pause come first.
        let paused = self.resume_pending(profile, &mut summary, cancel).await?;

        if !paused && !cancel.is_cancelled() {
            self.scrape_and_score(profile, query, &mut summary, cancel).await?;
        }

        if !summary.paused_on_quota && !cancel.is_cancelled() {
            self.drive_attempts(profile, &mut summary, cancel).await?;
        }

        self.notifier.present_summary(&summary).await;
        tracing::info!(
            found = summary.found,
            matched = summary.matched,
            applied = summary.applied,
            failed = summary.failed,
            "cycle finished"
        );
        Ok(summary)
    }

    /// Re-scores records still in `discovered` from an earlier run. Returns
    /// true when the cycle paused again on quota.
    async fn resume_pending(
        &self,
        profile: &CandidateProfile,
        summary: &mut CycleSummary,
        cancel: &CancelFlag,
    ) -> Result<bool, PipelineError> {
        let pending = self.ledger.list_by_state(profile.version, JobState::Discovered)?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "resuming undecided records");
        }

        for record in pending {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            match self.matcher.score(profile, &record.posting).await {
                Ok(result) => {
                    let key = record.dedup_key();
                    self.ledger.rescore(&key, &result)?;
                    self.ledger.transition(&key, result.decision.target_state())?;
                    count_decision(summary, result.decision);
                }
                Err(PipelineError::QuotaExceeded(detail)) => {
                    self.pause_on_quota(summary, &detail).await;
                    return Ok(true);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    async fn scrape_and_score(
        &self,
        profile: &CandidateProfile,
        query: &str,
        summary: &mut CycleSummary,
        cancel: &CancelFlag,
    ) -> Result<(), PipelineError> {
        'sources: for source in &self.config.sources {
            let mut stream = self.scraper.search(source, query);
            while let Some(item) = stream.next().await {
                if cancel.is_cancelled() {
                    tracing::info!("cycle cancelled between postings");
                    break 'sources;
                }
                match item {
                    SearchItem::SourceFailed(failure) => {
                        summary.sources_failed.push(failure.source.clone());
                        self.notifier
                            .notify(&format!(
                                "Source '{}' degraded ({}): {}",
                                failure.source, failure.kind, failure.detail
                            ))
                            .await;
                        // The marker is terminal for this source's stream;
                        // other sources are unaffected.
                    }
                    SearchItem::Posting(posting) => {
                        summary.found += 1;
                        match self.process_posting(profile, posting, summary).await {
                            Ok(()) => {}
                            Err(PipelineError::QuotaExceeded(detail)) => {
                                self.pause_on_quota(summary, &detail).await;
                                break 'sources;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn process_posting(
        &self,
        profile: &CandidateProfile,
        posting: JobPosting,
        summary: &mut CycleSummary,
    ) -> Result<(), PipelineError> {
        // A posting decided in an earlier cycle is only re-sighted, never
        // re-scored, unless its content drifted.
        let key = record_key(profile.version, &posting.source_id);
        if let Some(existing) = self.ledger.get(&key)? {
            if existing.state != JobState::Discovered
                && existing.posting.content_hash == posting.content_hash
            {
                self.ledger.touch(&key, posting.last_seen_at)?;
                return Ok(());
            }
        }

        match self.matcher.score(profile, &posting).await {
            Ok(result) => {
                let record = self.ledger.record(posting, profile.version, &result)?;
                // Only a fresh record is transitioned here; a record seen in
                // an earlier cycle already carries its decision.
                if record.state == JobState::Discovered {
                    self.ledger
                        .transition(&record.dedup_key(), result.decision.target_state())?;
                    count_decision(summary, result.decision);
                }
                Ok(())
            }
            Err(PipelineError::QuotaExceeded(detail)) => {
                // Keep the posting as `discovered` so the next cycle scores
                // it; do not clobber an existing record's score.
                if self.ledger.get(&key)?.is_none() {
                    let unscored = MatchResult {
                        score: 0.0,
                        rationale: "unscored: cycle paused on quota".to_string(),
                        decision: MatchDecision::NeedsReview,
                    };
                    self.ledger.record(posting, profile.version, &unscored)?;
                }
                Err(PipelineError::QuotaExceeded(detail))
            }
            Err(err) => Err(err),
        }
    }

    async fn pause_on_quota(&self, summary: &mut CycleSummary, detail: &str) {
        // Reported once; the cycle is resumable later.
        if !summary.paused_on_quota {
            summary.paused_on_quota = true;
            tracing::warn!(%detail, "pausing cycle: language-model quota exhausted");
            self.notifier
                .notify(&format!(
                    "Pipeline paused: language-model quota exhausted ({detail}). Re-run to resume."
                ))
                .await;
        }
    }

    /// Applies to matched records (approval-gated unless auto-apply is on)
    /// and re-drives failed records still below the attempt ceiling.
    async fn drive_attempts(
        &self,
        profile: &CandidateProfile,
        summary: &mut CycleSummary,
        cancel: &CancelFlag,
    ) -> Result<(), PipelineError> {
        let mut candidates = Vec::new();
        let mut awaiting_approval = 0u32;

        for record in self.ledger.list_by_state(profile.version, JobState::Matched)? {
            if self.config.apply.auto_apply || record.approved {
                candidates.push(record);
            } else {
                awaiting_approval += 1;
            }
        }

        for record in self
            .ledger
            .list_by_state(profile.version, JobState::ApplicationFailed)?
        {
            if record.failed_attempts() >= self.config.apply.max_attempts as usize {
                self.ledger.transition(&record.dedup_key(), JobState::Closed)?;
                tracing::info!(key = %record.dedup_key(), "closed after exhausting attempts");
            } else if self.config.apply.auto_apply || record.approved {
                candidates.push(record);
            }
        }

        if awaiting_approval > 0 {
            self.notifier
                .notify(&format!(
                    "{awaiting_approval} matched job(s) await your approval before applying."
                ))
                .await;
        }

        for record in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let key = record.dedup_key();
            let attempt = self.attempter.attempt(&self.ledger, &key, profile).await?;
            match attempt.outcome {
                AttemptOutcome::Success => summary.applied += 1,
                AttemptOutcome::CaptchaBlocked => {
                    summary.failed += 1;
                    self.notifier
                        .notify(&format!(
                            "Application for '{}' at {} hit a captcha. Please finish it manually: {}",
                            record.posting.title, record.posting.company, record.posting.apply_url
                        ))
                        .await;
                }
                _ => summary.failed += 1,
            }
        }
        Ok(())
    }

    /// Explicit user approval for one matched job, followed immediately by
    /// the attempt.
    pub async fn approve_and_apply(
        &self,
        profile: &CandidateProfile,
        source_id: &SourceId,
    ) -> Result<AttemptOutcome, PipelineError> {
        let key = record_key(profile.version, source_id);
        self.ledger.set_approved(&key, true)?;
        let attempt = self.attempter.attempt(&self.ledger, &key, profile).await?;
        if attempt.outcome == AttemptOutcome::CaptchaBlocked {
            self.notifier
                .notify("Application hit a captcha; manual completion needed.")
                .await;
        }
        Ok(attempt.outcome)
    }

    /// Explicit human decision on a needs-review record. Promotion never
    /// happens automatically.
    pub fn review(
        &self,
        profile_version: u32,
        source_id: &SourceId,
        accept: bool,
    ) -> Result<JobState, PipelineError> {
        let key = record_key(profile_version, source_id);
        let to = if accept { JobState::Matched } else { JobState::Rejected };
        let record = self.ledger.transition(&key, to)?;
        Ok(record.state)
    }

    /// External status correction (interview scheduled, site rejection,
    /// closing out a record).
    pub fn mark(
        &self,
        profile_version: u32,
        source_id: &SourceId,
        state: JobState,
    ) -> Result<JobState, PipelineError> {
        let key = record_key(profile_version, source_id);
        let record = self.ledger.transition(&key, state)?;
        Ok(record.state)
    }
}

fn count_decision(summary: &mut CycleSummary, decision: MatchDecision) {
    match decision {
        MatchDecision::Matched => summary.matched += 1,
        MatchDecision::NeedsReview => summary.needs_review += 1,
        MatchDecision::Rejected => summary.rejected += 1,
    }
}
