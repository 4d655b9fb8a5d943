mod ai;
mod attempter;
mod config;
mod ledger;
mod matcher;
mod models;
mod notify;
mod orchestrator;
mod profile;
mod scraper;
mod store;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::ai::AiProvider;
use crate::attempter::{Attempter, HttpApplyGateway};
use crate::config::Config;
use crate::ledger::JobLedger;
use crate::matcher::{LlmScorer, Matcher};
use crate::models::{JobState, SourceId};
use crate::notify::{ChatEvent, ConsoleNotifier};
use crate::orchestrator::{CancelFlag, Orchestrator};
use crate::profile::{PlainTextExtractor, ProfileBuilder};
use crate::scraper::{HttpFetcher, Scraper};
use crate::store::{KvStore, ProfileStore, SqliteStore};

#[derive(Parser)]
#[command(name = "pursuit")]
#[command(about = "Job search automation - discover, match, track, and apply")]
struct Cli {
    /// Path to the config file (defaults to the XDG config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage the candidate profile
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },

    /// Run one discovery-and-application cycle
    Run {
        /// User whose profile drives the cycle
        #[arg(short, long, default_value = "default")]
        user: String,

        /// Search query sent to each source
        #[arg(short, long)]
        query: String,

        /// Language model for scoring and drafting
        #[arg(short, long)]
        model: Option<String>,

        /// Run without the language model (heuristics only)
        #[arg(long)]
        no_llm: bool,

        /// Score and simulate without persisting job records
        #[arg(long)]
        dry_run: bool,
    },

    /// List tracked jobs
    Jobs {
        #[arg(short, long, default_value = "default")]
        user: String,

        /// Filter by state (discovered, matched, needs_review, applying,
        /// applied, application_failed, interviewing, rejected_by_site,
        /// rejected, closed)
        #[arg(short, long)]
        state: Option<String>,
    },

    /// Show one tracked job with its attempt history
    Show {
        #[arg(short, long, default_value = "default")]
        user: String,

        /// Job id as source:native-id (e.g. boards:42)
        job_id: String,
    },

    /// Approve a matched job and apply to it
    Approve {
        #[arg(short, long, default_value = "default")]
        user: String,

        /// Job id as source:native-id
        job_id: String,
    },

    /// Decide a needs-review job
    Review {
        #[arg(short, long, default_value = "default")]
        user: String,

        /// Job id as source:native-id
        job_id: String,

        /// Promote to matched (otherwise reject)
        #[arg(long)]
        accept: bool,
    },

    /// Record an external status change (interviewing, rejected_by_site, closed)
    Mark {
        #[arg(short, long, default_value = "default")]
        user: String,

        /// Job id as source:native-id
        job_id: String,

        /// Target state
        state: String,
    },

    /// Per-state counts for the current profile version
    Report {
        #[arg(short, long, default_value = "default")]
        user: String,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Submit a resume and receive clarification questions
    Submit {
        #[arg(short, long, default_value = "default")]
        user: String,

        /// Path to the resume file
        file: PathBuf,

        /// Resume format (txt, md)
        #[arg(short, long, default_value = "md")]
        format: String,

        /// Language model for resume analysis
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Answer a clarification question
    Answer {
        #[arg(short, long, default_value = "default")]
        user: String,

        /// Question id (from 'profile questions')
        question_id: String,

        /// Free-text answer
        text: String,
    },

    /// List unanswered clarification questions
    Questions {
        #[arg(short, long, default_value = "default")]
        user: String,
    },

    /// Freeze the draft into the next profile version
    Confirm {
        #[arg(short, long, default_value = "default")]
        user: String,
    },

    /// Show the current profile version
    Show {
        #[arg(short, long, default_value = "default")]
        user: String,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pursuit=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn open_store(check_initialized: bool) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open()?;
    if check_initialized {
        store.ensure_initialized()?;
    }
    Ok(Arc::new(store))
}

fn provider_from(config: &Config, model: Option<&str>, no_llm: bool) -> Option<Arc<dyn AiProvider>> {
    if no_llm {
        return None;
    }
    let name = model.unwrap_or(&config.llm.model);
    let spec = match ai::resolve_model(name) {
        Ok(spec) => spec,
        Err(err) => {
            eprintln!("Warning: {err}. Continuing without the language model.");
            return None;
        }
    };
    tracing::debug!(model = %spec.short_name, "using language model");
    match ai::create_provider(&spec, config.llm.timeout_secs) {
        Ok(provider) => Some(Arc::from(provider)),
        Err(err) => {
            eprintln!("Warning: {err}. Continuing without the language model.");
            None
        }
    }
}

fn parse_job_id(job_id: &str) -> Result<SourceId> {
    let (source, native_id) = job_id
        .split_once(':')
        .ok_or_else(|| anyhow!("Job id must look like source:native-id (e.g. boards:42)"))?;
    Ok(SourceId::new(source, native_id))
}

fn build_orchestrator(
    config: &Config,
    store: Arc<dyn KvStore>,
    provider: Option<Arc<dyn AiProvider>>,
) -> Result<Orchestrator> {
    let scorer = provider
        .clone()
        .map(|p| Box::new(LlmScorer::new(p, config.llm.max_tokens)) as Box<dyn matcher::FitScorer>);

    let captcha_markers: Vec<String> = config
        .sources
        .iter()
        .flat_map(|s| s.captcha_markers.iter().cloned())
        .collect();

    Ok(Orchestrator::new(
        config.clone(),
        Scraper::new(
            config.scrape.clone(),
            Arc::new(HttpFetcher::new(config.scrape.fetch_timeout_secs)?),
        ),
        Matcher::new(config.matching.clone(), scorer),
        JobLedger::new(store),
        Attempter::new(
            config.apply.clone(),
            Arc::new(HttpApplyGateway::new(
                config.apply.submit_timeout_secs,
                captcha_markers,
            )?),
            provider,
        ),
        Arc::new(ConsoleNotifier),
    ))
}

/// Handles one inbound chat event. The CLI is just one transport feeding
/// this; a bot would feed the same events.
async fn dispatch_event(
    event: ChatEvent,
    user: &str,
    config: &Config,
    store: Arc<dyn KvStore>,
    provider: Option<Arc<dyn AiProvider>>,
) -> Result<()> {
    match event {
        ChatEvent::SubmitResume { bytes, format } => {
            let builder = ProfileBuilder::new(store, provider, config.llm.max_tokens);
            let questions = builder
                .ingest_resume(user, &bytes, &format, &PlainTextExtractor)
                .await?;
            println!("Resume received. A few questions before the search starts:");
            for (id, question) in questions {
                println!("  [{id}] {question}");
            }
            println!("Answer with: pursuit profile answer --user {user} <id> <text>");
        }

        ChatEvent::Answer { question_id, text } => {
            let builder = ProfileBuilder::new(store, provider, config.llm.max_tokens);
            builder.record_answer(user, &question_id, &text)?;
            let remaining = builder.pending_questions(user)?;
            if remaining.is_empty() {
                println!("All questions answered. Confirm with: pursuit profile confirm --user {user}");
            } else {
                println!("Recorded. {} question(s) remaining.", remaining.len());
            }
        }

        ChatEvent::Approve { job_id } => {
            let source_id = parse_job_id(&job_id)?;
            let profiles = ProfileStore::new(store.as_ref());
            let profile = profiles
                .load_current(user)?
                .ok_or_else(|| anyhow!("No confirmed profile for '{user}'."))?;
            let orchestrator = build_orchestrator(config, store.clone(), provider)?;
            let outcome = orchestrator.approve_and_apply(&profile, &source_id).await?;
            println!("Application outcome for {job_id}: {}", outcome.label());
        }

        ChatEvent::Review { job_id, accept } => {
            let source_id = parse_job_id(&job_id)?;
            let profiles = ProfileStore::new(store.as_ref());
            let version = profiles
                .current_version(user)?
                .ok_or_else(|| anyhow!("No confirmed profile for '{user}'."))?;
            let orchestrator = build_orchestrator(config, store.clone(), provider)?;
            let state = orchestrator.review(version, &source_id, accept)?;
            println!("Job {job_id} is now {state}.");
        }
    }
    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() > max_len {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        s.to_string()
    }
}

const ALL_STATES: &[JobState] = &[
    JobState::Discovered,
    JobState::Matched,
    JobState::NeedsReview,
    JobState::Applying,
    JobState::Applied,
    JobState::ApplicationFailed,
    JobState::Interviewing,
    JobState::RejectedBySite,
    JobState::Rejected,
    JobState::Closed,
];

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {
            let store = SqliteStore::open()?;
            store.init()?;
            println!("Database initialized at {}", store.path().display());
        }

        Commands::Profile { command } => match command {
            ProfileCommands::Submit {
                user,
                file,
                format,
                model,
            } => {
                let store = open_store(true)?;
                let provider = provider_from(&config, model.as_deref(), false);
                let bytes = std::fs::read(&file)
                    .with_context(|| format!("Failed to read resume: {}", file.display()))?;
                dispatch_event(
                    ChatEvent::SubmitResume { bytes, format },
                    &user,
                    &config,
                    store,
                    provider,
                )
                .await?;
            }

            ProfileCommands::Answer {
                user,
                question_id,
                text,
            } => {
                let store = open_store(true)?;
                dispatch_event(
                    ChatEvent::Answer { question_id, text },
                    &user,
                    &config,
                    store,
                    None,
                )
                .await?;
            }

            ProfileCommands::Questions { user } => {
                let store = open_store(true)?;
                let builder = ProfileBuilder::new(store, None, config.llm.max_tokens);
                let pending = builder.pending_questions(&user)?;
                if pending.is_empty() {
                    println!("No unanswered questions.");
                } else {
                    for (id, question) in pending {
                        println!("  [{id}] {question}");
                    }
                }
            }

            ProfileCommands::Confirm { user } => {
                let store = open_store(true)?;
                let builder = ProfileBuilder::new(store, None, config.llm.max_tokens);
                let profile = builder.confirm(&user)?;
                println!(
                    "Profile v{} confirmed: {} skills, {} preferred titles.",
                    profile.version,
                    profile.skills.len(),
                    profile.preferred_titles.len()
                );
            }

            ProfileCommands::Show { user } => {
                let store = open_store(true)?;
                let profiles = ProfileStore::new(store.as_ref());
                match profiles.load_current(&user)? {
                    Some(profile) => {
                        println!("Profile v{} for {}", profile.version, profile.user_id);
                        println!("Skills: {}", profile.skills.iter().cloned().collect::<Vec<_>>().join(", "));
                        println!("Experience: {:.0} years", profile.experience_years);
                        println!("Preferred titles: {}", profile.preferred_titles.join(", "));
                        println!(
                            "Preferred locations: {}",
                            profile.preferred_locations.iter().cloned().collect::<Vec<_>>().join(", ")
                        );
                        if let Some(floor) = profile.salary_floor {
                            println!("Salary floor: ${floor}");
                        }
                        println!("Confirmed: {}", profile.confirmed_at);
                    }
                    None => println!("No confirmed profile for '{user}'."),
                }
            }
        },

        Commands::Run {
            user,
            query,
            model,
            no_llm,
            dry_run,
        } => {
            let store = open_store(true)?;
            let profiles = ProfileStore::new(store.as_ref());
            let profile = profiles
                .load_current(&user)?
                .ok_or_else(|| anyhow!("No confirmed profile for '{user}'. Submit a resume first."))?;
            if config.sources.is_empty() {
                return Err(anyhow!(
                    "No sources configured. Add sources to {}.",
                    Config::default_path()?.display()
                ));
            }

            // Dry runs keep the ledger in memory and hold every application
            // behind the approval gate, so nothing is recorded or submitted.
            let mut run_config = config.clone();
            let ledger_store: Arc<dyn KvStore> = if dry_run {
                println!("[DRY RUN] Job records will not be persisted and nothing is submitted.");
                run_config.apply.auto_apply = false;
                Arc::new(store::MemoryStore::new())
            } else {
                store
            };

            let provider = provider_from(&config, model.as_deref(), no_llm);
            let orchestrator = build_orchestrator(&run_config, ledger_store, provider)?;

            let cancel = CancelFlag::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Cancelling after the current posting...");
                    signal_cancel.cancel();
                }
            });

            orchestrator.run_cycle(&profile, &query, &cancel).await?;
        }

        Commands::Jobs { user, state } => {
            let store = open_store(true)?;
            let profiles = ProfileStore::new(store.as_ref());
            let version = profiles
                .current_version(&user)?
                .ok_or_else(|| anyhow!("No confirmed profile for '{user}'."))?;
            let ledger = JobLedger::new(store);

            let states: Vec<JobState> = match state.as_deref() {
                Some(s) => vec![JobState::parse(s).ok_or_else(|| anyhow!("Unknown state '{s}'"))?],
                None => ALL_STATES.to_vec(),
            };

            println!(
                "{:<20} {:<18} {:<28} {:<20} {:>6}",
                "ID", "STATE", "TITLE", "COMPANY", "SCORE"
            );
            println!("{}", "-".repeat(96));
            for state in states {
                for record in ledger.list_by_state(version, state)? {
                    println!(
                        "{:<20} {:<18} {:<28} {:<20} {:>6.2}",
                        truncate(&record.source_id.key(), 18),
                        record.state.label(),
                        truncate(&record.posting.title, 26),
                        truncate(&record.posting.company, 18),
                        record.match_score
                    );
                }
            }
        }

        Commands::Show { user, job_id } => {
            let store = open_store(true)?;
            let profiles = ProfileStore::new(store.as_ref());
            let version = profiles
                .current_version(&user)?
                .ok_or_else(|| anyhow!("No confirmed profile for '{user}'."))?;
            let ledger = JobLedger::new(store);
            let source_id = parse_job_id(&job_id)?;
            let key = models::record_key(version, &source_id);

            match ledger.get(&key)? {
                Some(record) => {
                    println!("Job {}", record.source_id);
                    println!("Title: {}", record.posting.title);
                    println!("Company: {}", record.posting.company);
                    println!("Location: {}", record.posting.location);
                    println!("State: {}", record.state);
                    println!("Score: {:.2} ({})", record.match_score, record.match_rationale);
                    println!("Apply URL: {}", record.posting.apply_url);
                    println!("Discovered: {}", record.posting.discovered_at);
                    println!("Last seen: {}", record.posting.last_seen_at);
                    if let Some(err) = record.last_error {
                        println!("Last error: {err}");
                    }
                    if !record.attempts.is_empty() {
                        println!("\nAttempts:");
                        for attempt in &record.attempts {
                            println!(
                                "  {}  {:<16} {}",
                                attempt.timestamp,
                                attempt.outcome.label(),
                                attempt.detail
                            );
                        }
                    }
                }
                None => println!("Job {job_id} not tracked for profile v{version}."),
            }
        }

        Commands::Approve { user, job_id } => {
            let store = open_store(true)?;
            let provider = provider_from(&config, None, false);
            dispatch_event(ChatEvent::Approve { job_id }, &user, &config, store, provider).await?;
        }

        Commands::Review { user, job_id, accept } => {
            let store = open_store(true)?;
            dispatch_event(
                ChatEvent::Review { job_id, accept },
                &user,
                &config,
                store,
                None,
            )
            .await?;
        }

        Commands::Mark { user, job_id, state } => {
            let store = open_store(true)?;
            let profiles = ProfileStore::new(store.as_ref());
            let version = profiles
                .current_version(&user)?
                .ok_or_else(|| anyhow!("No confirmed profile for '{user}'."))?;
            let target =
                JobState::parse(&state).ok_or_else(|| anyhow!("Unknown state '{state}'"))?;
            let source_id = parse_job_id(&job_id)?;
            let orchestrator = build_orchestrator(&config, store, None)?;
            let new_state = orchestrator.mark(version, &source_id, target)?;
            println!("Job {job_id} is now {new_state}.");
        }

        Commands::Report { user } => {
            let store = open_store(true)?;
            let profiles = ProfileStore::new(store.as_ref());
            let version = profiles
                .current_version(&user)?
                .ok_or_else(|| anyhow!("No confirmed profile for '{user}'."))?;
            let ledger = JobLedger::new(store);

            println!("Pipeline report (profile v{version})");
            println!("{}", "-".repeat(36));
            for state in ALL_STATES {
                let count = ledger.list_by_state(version, *state)?.len();
                if count > 0 {
                    println!("{:<20} {:>6}", state.label(), count);
                }
            }
        }
    }

    Ok(())
}
