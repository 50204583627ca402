//! Mailpull - download a whole mailbox for vectorization
//!
//! This is the command-line entry point. Sessions are stored in the
//! mailpull config directory, so an interrupted download can be resumed
//! from another invocation.

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use mailpull::source::{EmailSource, GmailSource, GraphSource, StaticToken, TokenProvider};
use mailpull::storage::{SessionStore, SqliteSessionStore};
use mailpull::vectorize::{HttpVectorizationSink, IdempotentSink};
use mailpull::{
    DownloadDeps, DownloadManager, DownloadOptions, DownloadOutcome, DownloadProgress,
    DownloadSession, LogProgressSink, SessionId, VectorizeConfig,
};
use std::sync::Arc;

/// Session database filename in the config directory
const SESSIONS_DB: &str = "sessions.db";

#[derive(Parser)]
#[command(name = "mailpull")]
#[command(version)]
#[command(about = "Resumable mailbox downloads with vectorization dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new download for a user
    Start {
        /// Mailbox owner, e.g. user@example.com
        #[arg(long)]
        user: String,

        #[arg(long, value_enum, default_value_t = Provider::Gmail)]
        provider: Provider,
    },

    /// Resume a paused or failed download
    Resume {
        /// Session id to resume
        #[arg(long, conflicts_with = "user")]
        session: Option<String>,

        /// Resume the most recent unfinished session for this user
        #[arg(long)]
        user: Option<String>,

        #[arg(long, value_enum, default_value_t = Provider::Gmail)]
        provider: Provider,
    },

    /// Show stored sessions
    Status {
        /// Show a single session
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Provider {
    Gmail,
    Graph,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run(Cli::parse()) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    config::init().context("Failed to initialize config directory")?;
    let store = open_store()?;

    match cli.command {
        Commands::Start { user, provider } => {
            let deps = download_deps(provider, store)?;
            let mut manager = DownloadManager::new(deps, DownloadOptions::load()?)?;
            manager.initialize_download(&user)?;
            drive(&mut manager)
        }
        Commands::Resume {
            session,
            user,
            provider,
        } => {
            let id = match (session, user) {
                (Some(id), _) => SessionId::new(id),
                (None, Some(user)) => store
                    .latest_for_user(&user)?
                    .map(|s| s.id)
                    .ok_or_else(|| anyhow!("No unfinished session for {}", user))?,
                (None, None) => return Err(anyhow!("Pass --session or --user")),
            };
            let deps = download_deps(provider, store)?;
            let mut manager = DownloadManager::restore(&id, deps, DownloadOptions::load()?)?;
            drive(&mut manager)
        }
        Commands::Status { session } => {
            let sessions = match session {
                Some(id) => {
                    let id = SessionId::new(id);
                    let session = store
                        .get(&id)?
                        .ok_or_else(|| anyhow!("Session not found: {}", id))?;
                    vec![session]
                }
                None => store.list()?,
            };
            if sessions.is_empty() {
                println!("No download sessions");
            }
            for session in &sessions {
                print_session(session);
            }
            Ok(())
        }
    }
}

fn open_store() -> Result<Arc<dyn SessionStore>> {
    let db_path = config::config_path(SESSIONS_DB)
        .ok_or_else(|| anyhow!("Could not determine config directory"))?;
    Ok(Arc::new(SqliteSessionStore::open(&db_path)?))
}

fn download_deps(provider: Provider, store: Arc<dyn SessionStore>) -> Result<DownloadDeps> {
    let token = std::env::var("MAILPULL_ACCESS_TOKEN")
        .context("MAILPULL_ACCESS_TOKEN must hold an OAuth access token for the provider")?;
    let tokens: Arc<dyn TokenProvider> = Arc::new(StaticToken::new(token));

    let source: Arc<dyn EmailSource> = match provider {
        Provider::Gmail => Arc::new(GmailSource::new(tokens)),
        Provider::Graph => Arc::new(GraphSource::new(tokens)),
    };

    let vectorize = VectorizeConfig::load()?;
    info!("Publishing vectorization requests to {}", vectorize.endpoint);
    let sink = Arc::new(IdempotentSink::new(HttpVectorizationSink::from_config(&vectorize)));

    Ok(DownloadDeps::new(source, sink, store).with_progress(Arc::new(LogProgressSink)))
}

/// Download until done or paused, with Ctrl-C mapped to pause
///
/// `start_download` starts a session that never left `initializing` and
/// resumes a paused or errored one, so both subcommands go through it.
fn drive(manager: &mut DownloadManager) -> Result<()> {
    let control = manager.control();
    if let Err(e) = ctrlc::set_handler(move || control.pause()) {
        warn!("Could not install Ctrl-C handler: {}", e);
    }

    let outcome = manager.start_download();
    manager.wait_for_dispatch();

    let session_id = manager.session().map(|s| s.id.to_string()).unwrap_or_default();
    match outcome? {
        DownloadOutcome::Paused => {
            info!("Paused. Continue with: mailpull resume --session {}", session_id)
        }
        DownloadOutcome::AlreadyRunning => warn!("Session {} is already downloading", session_id),
        DownloadOutcome::Completed | DownloadOutcome::Cancelled => {}
    }
    Ok(())
}

fn print_session(session: &DownloadSession) {
    let progress = DownloadProgress::from_session(session, "");
    println!(
        "{}  {:<12} {:<30} {}  updated {}",
        session.id,
        session.status.as_str(),
        session.user_identity,
        progress.summary(),
        session.updated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
    );
    if !session.failed_email_ids.is_empty() {
        println!("    {} emails could not be fetched", session.failed_email_ids.len());
    }
    if let Some(err) = &session.last_error {
        println!("    last error: {}", err);
    }
}
