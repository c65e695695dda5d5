use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use subzero_mini::{
    background::{self, BackgroundCoordinator},
    config::{self, BotConfig},
    protocol::bridge::BridgeConnector,
    state::AppState,
    store::CredentialStore,
};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "subzero-mini", about = "Multi-account WhatsApp bot session core", version)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long, default_value = "subzero.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore stored sessions and start the HTTP server
    Serve,
    /// Inspect or remove stored account sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
}

#[derive(Subcommand)]
enum SessionsAction {
    /// Print stored accounts with their timestamps
    List {
        /// Only accounts not updated for this many days
        #[arg(long)]
        stale_days: Option<i64>,
    },
    /// Delete an account's stored session and known-number entry
    Delete {
        /// Account number (digits, optionally with + or a JID suffix)
        number: String,
    },
}

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging from RUST_LOG (default: info)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "subzero_mini=info".into()),
        )
        .init();

    std::panic::set_hook(Box::new(|panic| {
        error!("panic: {}", panic);
    }));

    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cfg).await,
        Commands::Sessions { action } => match action {
            SessionsAction::List { stale_days } => list_sessions(&cfg, stale_days),
            SessionsAction::Delete { number } => delete_session(&cfg, &number),
        },
    }
}

// ── Serve ──────────────────────────────────────────────────────────────────

async fn serve(cfg: BotConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid bind address")?;

    info!("Opening session store at {}...", cfg.database_path.display());
    let connector = Arc::new(BridgeConnector::new(cfg.bridge_url.clone()));
    let state = AppState::init(cfg, connector)?;
    info!("Session store ready");

    // Background task coordinator
    let coordinator = BackgroundCoordinator::new();
    let sweeper_state = state.clone();
    let sweeper_shutdown = coordinator.subscribe_shutdown();
    tokio::spawn(async move {
        background::sweeper::run(sweeper_state, sweeper_shutdown).await;
    });
    info!("Background: sweeper started (60s interval)");

    // Bulk restore runs beside the listener; each account is independent.
    let manager = state.manager.clone();
    tokio::spawn(async move {
        if let Err(e) = manager.restore_all().await {
            error!("bulk restore failed: {:#}", e);
        }
    });

    let app = subzero_mini::routes::app(state.clone());

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind TCP listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    coordinator.shutdown();
    info!("Background tasks signalled to stop.");

    state.manager.shutdown().await;
    info!("Server stopped.");
    Ok(())
}

// ── Graceful shutdown ──────────────────────────────────────────────────────

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, stopping server...");
}

// ── Session maintenance ────────────────────────────────────────────────────

fn open_store(cfg: &BotConfig) -> anyhow::Result<CredentialStore> {
    CredentialStore::open(&cfg.database_path).with_context(|| {
        format!(
            "failed to open credential store at {}",
            cfg.database_path.display()
        )
    })
}

fn list_sessions(cfg: &BotConfig, stale_days: Option<i64>) -> anyhow::Result<()> {
    let store = open_store(cfg)?;
    let known = store.known_numbers()?;
    let numbers = match stale_days {
        Some(days) => store.stale_since(chrono::Utc::now() - chrono::Duration::days(days))?,
        None => store.numbers()?,
    };
    if numbers.is_empty() {
        println!("No stored sessions.");
        return Ok(());
    }

    println!(
        "{:<16} {:<6} {:<6} {:<25} {:<25} {}",
        "NUMBER", "CREDS", "KNOWN", "CREATED", "UPDATED", "LAST ACTIVE"
    );
    for number in numbers {
        let Some(session) = store.load(&number)? else {
            continue;
        };
        println!(
            "{:<16} {:<6} {:<6} {:<25} {:<25} {}",
            session.number,
            if session.creds.is_some() { "yes" } else { "no" },
            if known.contains(&session.number) { "yes" } else { "no" },
            session.created_at.to_rfc3339(),
            session.updated_at.to_rfc3339(),
            session
                .last_active
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

fn delete_session(cfg: &BotConfig, raw: &str) -> anyhow::Result<()> {
    let number = subzero_mini::number::normalize(raw)?;
    let store = open_store(cfg)?;
    if store.purge(&number)? {
        println!("Deleted stored session for {number}.");
    } else {
        println!("No stored session for {number}; known-number entry cleared.");
    }
    Ok(())
}
