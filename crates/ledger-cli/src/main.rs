use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ledger_core::validate::{optional_text, require_text};
use ledger_core::{AttemptOutcome, DecisionFilter, DecisionStatus, NewAttempt, NewDecision, NewNote};
use ledger_storage::{default_base_dir, LedgerManager, LedgerStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod output;

#[derive(Parser)]
#[command(name = "ledger")]
#[command(about = "Per-project ledger of decisions, overrides, AI attempts and notes", long_about = None)]
struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,
    /// Directory holding the per-project stores
    #[arg(long, global = true, env = "LEDGER_HOME")]
    base_dir: Option<PathBuf>,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    /// Log at debug level to stderr
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store for the project
    Init,
    /// Record a decision
    Decide {
        decision: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        rationale: Option<String>,
        /// Alternative that was considered and rejected (repeatable)
        #[arg(long = "rejected")]
        rejected: Vec<String>,
        /// Session name to file the decision under
        #[arg(long)]
        session: Option<String>,
    },
    /// List decisions
    Decisions {
        #[arg(long)]
        status: Option<DecisionStatus>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
    /// Active decisions related to a description of the task at hand
    Relevant { query: String },
    /// Archive a decision
    Archive { id: String },
    /// Override a decision, recording why
    Override {
        id: String,
        rationale: String,
        #[arg(long, default_value = "main")]
        session: String,
    },
    /// Repeatedly overridden decisions and stopgap overrides
    Patterns {
        #[arg(long, default_value_t = 2)]
        min: u32,
        /// List overrides whose rationale reads like a temporary fix instead
        #[arg(long)]
        temporary: bool,
    },
    /// Track AI suggestions and how they turned out
    Attempt {
        #[command(subcommand)]
        action: AttemptCommands,
    },
    /// Free-form notes
    Note {
        #[command(subcommand)]
        action: NoteCommands,
    },
    /// Sessions and forks
    Session {
        #[command(subcommand)]
        action: SessionCommands,
    },
}

#[derive(Subcommand)]
enum AttemptCommands {
    Add {
        problem: String,
        suggestion: String,
        #[arg(long, default_value = "main")]
        session: String,
    },
    Worked {
        id: String,
    },
    Failed {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Partial {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Earlier failed attempts at a similar problem
    Similar {
        problem: String,
    },
    /// Suggestions that keep failing
    Recurring {
        #[arg(long, default_value_t = 2)]
        min: u32,
    },
    Stats,
}

#[derive(Subcommand)]
enum NoteCommands {
    Add {
        content: String,
        #[arg(long)]
        session: Option<String>,
    },
    List {
        #[arg(long)]
        limit: Option<u32>,
    },
    Search {
        text: String,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    List,
    Fork { parent: String, name: String },
}

#[derive(Serialize)]
struct InitReport<'a> {
    project_id: &'a str,
    slug: &'a str,
    db_path: &'a Path,
    created: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let base_dir = match &cli.base_dir {
        Some(base_dir) => base_dir.clone(),
        None => default_base_dir().context("Failed to resolve ledger base directory")?,
    };
    let project_path = resolve_project_path(cli.project.as_deref())?;
    debug!(
        base_dir = %base_dir.display(),
        project = %project_path.display(),
        "resolved ledger paths"
    );

    let manager = LedgerManager::new(base_dir);
    let result = run(&cli, &manager, &project_path);
    let closed = manager
        .close_all()
        .context("Failed to close ledger stores");
    result?;
    closed
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("LEDGER_LOG_LEVEL") {
        level
    } else {
        "warn".to_string()
    };

    let filter = if debug {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_project_path(project: Option<&Path>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(match project {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => cwd.join(path),
        None => cwd,
    })
}

fn session_id(store: &LedgerStore, name: Option<&str>) -> Result<Option<String>> {
    let Some(name) = optional_text(name) else {
        return Ok(None);
    };
    let session = store
        .get_or_create_session(&name)
        .with_context(|| format!("Failed to resolve session {name}"))?;
    Ok(Some(session.id))
}

fn run(cli: &Cli, manager: &LedgerManager, project_path: &Path) -> Result<()> {
    let json = cli.json;
    let created = !manager.is_initialized(project_path);
    let store = manager.get(project_path)?;

    match &cli.command {
        Commands::Init => {
            let report = InitReport {
                project_id: store.project_id(),
                slug: store.project_slug(),
                db_path: store.db_path(),
                created,
            };
            output::emit(json, &report, |report| {
                let verb = if report.created {
                    "Initialized"
                } else {
                    "Already initialized"
                };
                println!("{verb} ledger for {} at {}", report.slug, report.db_path.display());
            })
        }
        Commands::Decide {
            decision,
            category,
            rationale,
            rejected,
            session,
        } => {
            let decision = require_text("decision", decision)?;
            let rejected: Vec<String> = rejected
                .iter()
                .filter_map(|alternative| optional_text(Some(alternative.as_str())))
                .collect();
            let recorded = store.create_decision(NewDecision {
                session_id: session_id(&store, session.as_deref())?,
                category: optional_text(category.as_deref()),
                decision: decision.to_string(),
                rationale: optional_text(rationale.as_deref()),
                alternatives_rejected: (!rejected.is_empty()).then_some(rejected),
                ..NewDecision::default()
            })?;
            output::emit(json, &recorded, |recorded| {
                println!("Recorded decision {}", recorded.id);
            })
        }
        Commands::Decisions {
            status,
            category,
            search,
            limit,
            offset,
        } => {
            let decisions = store.list_decisions(&DecisionFilter {
                category: optional_text(category.as_deref()),
                status: *status,
                search: optional_text(search.as_deref()),
                limit: *limit,
                offset: *offset,
                ..DecisionFilter::default()
            })?;
            output::emit(json, decisions.as_slice(), output::decisions)
        }
        Commands::Relevant { query } => {
            let decisions = store.find_relevant_decisions(query)?;
            output::emit(json, decisions.as_slice(), output::decisions)
        }
        Commands::Archive { id } => {
            store
                .archive_decision(id)
                .with_context(|| format!("Failed to archive decision {id}"))?;
            output::emit(json, &serde_json::json!({ "archived": id }), |_| {
                println!("Archived decision {id}");
            })
        }
        Commands::Override {
            id,
            rationale,
            session,
        } => {
            let rationale = require_text("rationale", rationale)?;
            let session = require_text("session", session)?;
            let session_id = session_id(&store, Some(session))?.unwrap_or_default();
            let recorded = store
                .override_decision(id, &session_id, rationale)
                .with_context(|| format!("Failed to override decision {id}"))?;
            output::emit(json, &recorded, |recorded| {
                println!("Overrode decision {} ({})", recorded.decision_id, recorded.id);
            })
        }
        Commands::Patterns { min, temporary } => {
            if *temporary {
                let overrides = store.find_temporary_patterns()?;
                output::emit(json, overrides.as_slice(), output::overrides)
            } else {
                let patterns = store.override_patterns(*min)?;
                output::emit(json, patterns.as_slice(), output::override_patterns)
            }
        }
        Commands::Attempt { action } => run_attempt(&store, action, json),
        Commands::Note { action } => run_note(&store, action, json),
        Commands::Session { action } => run_session(&store, action, json),
    }
}

fn run_attempt(store: &LedgerStore, action: &AttemptCommands, json: bool) -> Result<()> {
    let (id, outcome, reason) = match action {
        AttemptCommands::Add {
            problem,
            suggestion,
            session,
        } => {
            let problem = require_text("problem", problem)?;
            let suggestion = require_text("suggestion", suggestion)?;
            let session = require_text("session", session)?;
            let attempt = store.create_attempt(NewAttempt {
                session_id: session_id(store, Some(session))?.unwrap_or_default(),
                problem: problem.to_string(),
                suggestion: suggestion.to_string(),
                ..NewAttempt::default()
            })?;
            return output::emit(json, &attempt, |attempt| {
                println!("Recorded attempt {}", attempt.id);
            });
        }
        AttemptCommands::Similar { problem } => {
            let attempts = store.find_similar_failed_attempts(problem)?;
            return output::emit(json, attempts.as_slice(), output::attempts);
        }
        AttemptCommands::Recurring { min } => {
            let failures = store.recurring_failures(*min)?;
            return output::emit(json, failures.as_slice(), output::recurring_failures);
        }
        AttemptCommands::Stats => {
            let stats = store.attempt_stats()?;
            return output::emit(json, &stats, |stats| {
                if stats.is_empty() {
                    println!("No attempts recorded");
                }
                for (outcome, count) in stats {
                    println!("{outcome:<8} {count}");
                }
            });
        }
        AttemptCommands::Worked { id } => (id, AttemptOutcome::Worked, None),
        AttemptCommands::Failed { id, reason } => (id, AttemptOutcome::Failed, reason.as_deref()),
        AttemptCommands::Partial { id, reason } => {
            (id, AttemptOutcome::Partial, reason.as_deref())
        }
    };

    store
        .update_attempt_outcome(id, outcome, reason)
        .with_context(|| format!("Failed to update attempt {id}"))?;
    output::emit(
        json,
        &serde_json::json!({ "id": id, "outcome": outcome }),
        |_| println!("Marked attempt {id} {outcome}"),
    )
}

fn run_note(store: &LedgerStore, action: &NoteCommands, json: bool) -> Result<()> {
    match action {
        NoteCommands::Add { content, session } => {
            let content = require_text("content", content)?;
            let note = match session_id(store, session.as_deref())? {
                Some(session_id) => store.create_note(NewNote {
                    session_id: Some(session_id),
                    content: content.to_string(),
                    ..NewNote::default()
                })?,
                None => store.quick_note(content)?,
            };
            output::emit(json, &note, |note| println!("Recorded note {}", note.id))
        }
        NoteCommands::List { limit } => {
            let notes = match limit {
                Some(limit) => store.recent_notes(*limit)?,
                None => store.list_notes()?,
            };
            output::emit(json, notes.as_slice(), output::notes)
        }
        NoteCommands::Search { text } => {
            let notes = store.search_notes(text)?;
            output::emit(json, notes.as_slice(), output::notes)
        }
    }
}

fn run_session(store: &LedgerStore, action: &SessionCommands, json: bool) -> Result<()> {
    match action {
        SessionCommands::List => {
            let sessions = store.list_sessions()?;
            output::emit(json, sessions.as_slice(), output::sessions)
        }
        SessionCommands::Fork { parent, name } => {
            let name = require_text("name", name)?;
            let session = store
                .fork_session(parent, name)
                .with_context(|| format!("Failed to fork session {parent}"))?;
            output::emit(json, &session, |session| {
                println!("Forked session {} from {parent}", session.id);
            })
        }
    }
}
