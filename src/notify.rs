use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Aggregate counts for one pipeline cycle, presented once at the end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub found: u32,
    pub matched: u32,
    pub applied: u32,
    pub failed: u32,
    pub needs_review: u32,
    pub rejected: u32,
    /// Sources that ended in a terminal failure marker this cycle.
    pub sources_failed: Vec<String>,
    /// Set when the cycle paused on collaborator quota exhaustion; the next
    /// run resumes where this one stopped.
    pub paused_on_quota: bool,
}

/// Outbound chat contract. The pipeline depends on these two calls only; the
/// transport behind them is not its concern.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str);
    async fn present_summary(&self, summary: &CycleSummary);
}

/// Inbound chat contract: the events a transport can deliver.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    SubmitResume { bytes: Vec<u8>, format: String },
    Answer { question_id: String, text: String },
    Approve { job_id: String },
    Review { job_id: String, accept: bool },
}

/// Plain-terminal notifier used by the CLI.
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, text: &str) {
        println!("{text}");
    }

    async fn present_summary(&self, summary: &CycleSummary) {
        println!("Cycle summary");
        println!("{}", "-".repeat(40));
        println!("{:<16} {:>6}", "found", summary.found);
        println!("{:<16} {:>6}", "matched", summary.matched);
        println!("{:<16} {:>6}", "applied", summary.applied);
        println!("{:<16} {:>6}", "failed", summary.failed);
        println!("{:<16} {:>6}", "needs review", summary.needs_review);
        println!("{:<16} {:>6}", "rejected", summary.rejected);
        if !summary.sources_failed.is_empty() {
            println!("sources failed: {}", summary.sources_failed.join(", "));
        }
        if summary.paused_on_quota {
            println!("cycle paused: language-model quota exhausted; re-run to resume");
        }
    }
}
