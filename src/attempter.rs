use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::ai::{self, AiProvider};
use crate::config::ApplyConfig;
use crate::ledger::JobLedger;
use crate::models::{
    AttemptOutcome, AttemptRecord, CandidateProfile, ErrorKind, JobPosting, JobState,
    PipelineError,
};

/// How one submission try failed. The gateway classifies; the attempter
/// decides retry policy.
#[derive(Debug, thiserror::Error)]
pub enum SubmitFailure {
    #[error("captcha challenge on application form")]
    Captcha,

    #[error("application form did not match expectations: {0}")]
    FormMismatch(String),

    #[error("site rejected the submission: {0}")]
    RejectedBySite(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

/// The submission workflow collaborator. Real browser automation lives behind
/// this seam; the core only sees the classified outcome.
#[async_trait]
pub trait ApplyGateway: Send + Sync {
    async fn submit(
        &self,
        posting: &JobPosting,
        profile: &CandidateProfile,
        answers: &BTreeMap<String, String>,
    ) -> Result<(), SubmitFailure>;
}

/// Minimal HTTP form gateway: posts the candidate's details to the apply URL
/// and classifies the response.
pub struct HttpApplyGateway {
    client: reqwest::Client,
    captcha_markers: Vec<String>,
}

impl HttpApplyGateway {
    pub fn new(timeout_secs: u64, captcha_markers: Vec<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("pursuit/0.1")
            .build()?;
        Ok(Self {
            client,
            captcha_markers,
        })
    }
}

#[async_trait]
impl ApplyGateway for HttpApplyGateway {
    async fn submit(
        &self,
        posting: &JobPosting,
        profile: &CandidateProfile,
        answers: &BTreeMap<String, String>,
    ) -> Result<(), SubmitFailure> {
        let payload = serde_json::json!({
            "candidate": profile.user_id,
            "skills": profile.skills,
            "experience_years": profile.experience_years,
            "answers": answers,
        });

        let response = self
            .client
            .post(&posting.apply_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SubmitFailure::Transient(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let lowered = body.to_lowercase();

        for marker in &self.captcha_markers {
            if lowered.contains(&marker.to_lowercase()) {
                return Err(SubmitFailure::Captcha);
            }
        }

        match status {
            200..=299 => Ok(()),
            400 | 422 => Err(SubmitFailure::FormMismatch(format!("status {status}"))),
            403 | 451 => Err(SubmitFailure::RejectedBySite(format!("status {status}"))),
            _ => Err(SubmitFailure::Transient(format!("status {status}"))),
        }
    }
}

/// Executes the apply step for matched records, appending an attempt record
/// per try and walking the state machine through `applying`.
pub struct Attempter {
    config: ApplyConfig,
    gateway: Arc<dyn ApplyGateway>,
    provider: Option<Arc<dyn AiProvider>>,
}

impl Attempter {
    pub fn new(
        config: ApplyConfig,
        gateway: Arc<dyn ApplyGateway>,
        provider: Option<Arc<dyn AiProvider>>,
    ) -> Self {
        Self {
            config,
            gateway,
            provider,
        }
    }

    /// Runs the submission workflow for the record at `key`.
    ///
    /// Preconditions: the record is `matched`, or `application_failed` below
    /// the re-attempt ceiling. Anything else is a caller bug and fails with
    /// `PreconditionError`; a record at the ceiling is closed as a side
    /// effect of the refusal.
    pub async fn attempt(
        &self,
        ledger: &JobLedger,
        key: &str,
        profile: &CandidateProfile,
    ) -> Result<AttemptRecord, PipelineError> {
        let record = ledger
            .get(key)?
            .ok_or_else(|| PipelineError::Precondition(format!("no job record for key {key}")))?;

        match record.state {
            JobState::Matched => {}
            JobState::ApplicationFailed => {
                if record.failed_attempts() >= self.config.max_attempts as usize {
                    ledger.transition(key, JobState::Closed)?;
                    return Err(PipelineError::Precondition(format!(
                        "job {key} reached the attempt ceiling ({}); closed",
                        self.config.max_attempts
                    )));
                }
            }
            other => {
                return Err(PipelineError::Precondition(format!(
                    "attempt requested for job {key} in state {other}"
                )));
            }
        }

        ledger.transition(key, JobState::Applying)?;
        let answers = self.build_answers(profile, &record.posting).await;

        let mut try_number = record.failed_attempts();
        loop {
            try_number += 1;
            let outcome = tokio::time::timeout(
                Duration::from_secs(self.config.submit_timeout_secs),
                self.gateway.submit(&record.posting, profile, &answers),
            )
            .await
            .unwrap_or_else(|_| {
                Err(SubmitFailure::Transient(format!(
                    "submission timed out after {}s",
                    self.config.submit_timeout_secs
                )))
            });

            match outcome {
                Ok(()) => {
                    let attempt = AttemptRecord {
                        timestamp: Utc::now(),
                        outcome: AttemptOutcome::Success,
                        detail: format!("submitted on try {try_number}"),
                    };
                    ledger.append_attempt(key, attempt.clone(), None)?;
                    ledger.transition(key, JobState::Applied)?;
                    tracing::info!(key = %key, tries = try_number, "application submitted");
                    return Ok(attempt);
                }

                Err(SubmitFailure::Captcha) => {
                    // Terminal for this job; a human has to finish it.
                    let attempt = AttemptRecord {
                        timestamp: Utc::now(),
                        outcome: AttemptOutcome::CaptchaBlocked,
                        detail: "captcha challenge during submission".to_string(),
                    };
                    ledger.append_attempt(key, attempt.clone(), Some(ErrorKind::CaptchaBlocked))?;
                    ledger.transition(key, JobState::ApplicationFailed)?;
                    tracing::warn!(key = %key, "captcha blocked application, manual completion needed");
                    return Ok(attempt);
                }

                Err(SubmitFailure::FormMismatch(detail)) => {
                    let attempt = AttemptRecord {
                        timestamp: Utc::now(),
                        outcome: AttemptOutcome::FormMismatch,
                        detail,
                    };
                    ledger.append_attempt(key, attempt.clone(), Some(ErrorKind::StructuralMismatch))?;
                    ledger.transition(key, JobState::ApplicationFailed)?;
                    return Ok(attempt);
                }

                Err(SubmitFailure::RejectedBySite(detail)) => {
                    let attempt = AttemptRecord {
                        timestamp: Utc::now(),
                        outcome: AttemptOutcome::RejectedBySite,
                        detail,
                    };
                    ledger.append_attempt(key, attempt.clone(), None)?;
                    ledger.transition(key, JobState::ApplicationFailed)?;
                    return Ok(attempt);
                }

                Err(SubmitFailure::Transient(detail)) => {
                    let attempt = AttemptRecord {
                        timestamp: Utc::now(),
                        outcome: AttemptOutcome::TransientError,
                        detail,
                    };
                    let updated =
                        ledger.append_attempt(key, attempt.clone(), Some(ErrorKind::TransportError))?;

                    if updated.failed_attempts() >= self.config.max_attempts as usize {
                        ledger.transition(key, JobState::ApplicationFailed)?;
                        tracing::warn!(key = %key, "transient failures exhausted the attempt ceiling");
                        return Ok(attempt);
                    }

                    // Linear backoff between transient retries.
                    let delay = self.config.retry_delay_ms * try_number as u64;
                    tracing::debug!(key = %key, try_number, delay_ms = delay, "retrying submission");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    /// Stock answers plus, when a provider is wired, a drafted response for
    /// the customary free-text question. Drafting failures degrade to the
    /// profile summary; they never fail the attempt.
    async fn build_answers(
        &self,
        profile: &CandidateProfile,
        posting: &JobPosting,
    ) -> BTreeMap<String, String> {
        let mut answers = profile.answers.clone();
        if answers.contains_key("why_interested") {
            return answers;
        }

        let drafted = match &self.provider {
            Some(provider) => ai::draft_answer(
                provider.as_ref(),
                &profile.prompt_summary(),
                &posting.title,
                "Why are you interested in this role?",
                512,
            )
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "answer drafting failed, using profile summary");
                err
            })
            .ok(),
            None => None,
        };

        answers.insert(
            "why_interested".to_string(),
            drafted.unwrap_or_else(|| profile.prompt_summary()),
        );
        answers
    }
}
