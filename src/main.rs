//! Gatekeeper - Guild Welcome & Verification Bot
//!
//! Runs the bot against the simulated platform. The fixture supplies the
//! platform directory plus gateway events to replay after ready.

use clap::Parser;
use gatekeeper::bot::{Gatekeeper, RecordingOutbox};
use gatekeeper::config::{AppConfig, DATA_DIR_DEFAULT};
use gatekeeper::persistence::ConfigStore;
use gatekeeper::sim::{Fixture, ScriptedEvent, SimulatedPlatform};
use gatekeeper::{EntityStore, Resolver, SharedEntityStore, APP_NAME, APP_VERSION, VERIFY_BUTTON_ID};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// =============================================================================
// CLI
// =============================================================================

/// Gatekeeper - welcome new guild members and verify them with one click
#[derive(Parser, Debug)]
#[command(name = APP_NAME)]
#[command(about = "Guild welcome and verification bot over a lazily populated entity cache")]
#[command(version)]
struct Cli {
    /// Directory holding saved guild configuration
    #[arg(long, default_value = DATA_DIR_DEFAULT)]
    data_dir: String,

    /// Platform fixture (JSON) served by the simulated platform
    #[arg(long)]
    fixture: Option<PathBuf>,

    /// Deadline for one platform fetch
    #[arg(long)]
    fetch_timeout_ms: Option<u64>,

    /// Simulated one-way platform latency
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Let concurrent misses for one entity each issue their own fetch
    #[arg(long)]
    no_coalesce: bool,

    /// Interval between configuration snapshots
    #[arg(long)]
    save_interval_secs: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .init();

    tracing::info!("Gatekeeper v{}", APP_VERSION);

    // Expand data directory
    let data_dir = shellexpand::tilde(&cli.data_dir).to_string();
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Data directory: {}", data_dir);

    let config = build_config(&cli, &data_dir)?;

    let fixture = match &config.fixture {
        Some(path) => Fixture::from_json_file(path)?,
        None => {
            tracing::warn!("No fixture given (--fixture or GATEKEEPER_FIXTURE); platform is empty");
            Fixture::default()
        }
    };

    // Hydrate the store with configuration saved by the previous run
    let config_store = ConfigStore::new(&config.data_dir);
    let store: SharedEntityStore = Arc::new(EntityStore::with_saved_config(config_store.load()?));

    let platform = SimulatedPlatform::new(
        tokio::runtime::Handle::current(),
        fixture.directory,
        config.sim.clone(),
    );
    let resolver = Resolver::new(Arc::clone(&store), Arc::new(platform), config.resolver.clone());
    let bot = Arc::new(
        Gatekeeper::new(resolver, Arc::new(RecordingOutbox::new()))
            .with_config_store(config_store.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let saver = tokio::spawn(run_periodic_save(
        config_store.clone(),
        Arc::clone(&store),
        config.save_interval,
        shutdown_rx,
    ));

    // Resolver calls block, so the session runs on the blocking pool.
    let events = fixture.events;
    let session_bot = Arc::clone(&bot);
    let session = tokio::task::spawn_blocking(move || {
        session_bot.handle_ready();
        for event in events {
            replay(&session_bot, event);
        }
    });

    tokio::select! {
        joined = session => {
            joined?;
            tracing::info!("Event replay finished, press ctrl-c to exit");
            tokio::signal::ctrl_c().await?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
        }
    }

    tracing::info!("Shutting down...");
    shutdown_tx.send_replace(true);
    saver.await?;

    let (writer, snapshot) = (config_store.clone(), Arc::clone(&store));
    let saved = tokio::task::spawn_blocking(move || writer.save(&snapshot)).await??;
    tracing::info!(
        guilds = saved,
        stats = ?bot.resolver().stats(),
        "Saved guild configuration to {}",
        config_store.path().display()
    );

    Ok(())
}

/// Defaults, then environment, then CLI flags
fn build_config(cli: &Cli, data_dir: &str) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::new(data_dir);
    config.apply_env()?;

    if let Some(fixture) = &cli.fixture {
        config.fixture = Some(fixture.clone());
    }
    if let Some(ms) = cli.fetch_timeout_ms {
        anyhow::ensure!(ms > 0, "--fetch-timeout-ms must be positive");
        config.resolver = config.resolver.with_fetch_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = cli.latency_ms {
        config.sim = config.sim.with_latency(Duration::from_millis(ms));
    }
    if cli.no_coalesce {
        config.resolver = config.resolver.with_coalescing(false);
    }
    if let Some(secs) = cli.save_interval_secs {
        anyhow::ensure!(secs > 0, "--save-interval-secs must be positive");
        config.save_interval = Duration::from_secs(secs);
    }

    tracing::debug!(config = ?config, "Resolved configuration");
    Ok(config)
}

fn replay(bot: &Gatekeeper, event: ScriptedEvent) {
    match event {
        ScriptedEvent::MemberJoin { guild_id, user_id } => {
            let outcome = bot.handle_member_join(guild_id, user_id);
            tracing::info!(guild_id = %guild_id, user_id = %user_id, outcome = ?outcome, "member join");
        }
        ScriptedEvent::VerifyClick { guild_id, user_id } => {
            let outcome = bot.handle_button_click(guild_id, user_id, VERIFY_BUTTON_ID);
            tracing::info!(guild_id = %guild_id, user_id = %user_id, outcome = ?outcome, "verify click");
        }
    }
}

/// Snapshot configuration every `period` until shutdown is signalled
async fn run_periodic_save(
    config_store: ConfigStore,
    store: SharedEntityStore,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (writer, snapshot) = (config_store.clone(), Arc::clone(&store));
                match tokio::task::spawn_blocking(move || writer.save(&snapshot)).await {
                    Ok(Ok(count)) => tracing::debug!(guilds = count, "Periodic configuration save"),
                    Ok(Err(e)) => tracing::error!("Failed to save guild configuration: {}", e),
                    Err(e) => tracing::error!("Configuration save task failed: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
