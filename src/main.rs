//! Bridge Relayer - trusted relayer for the two-chain fee-lock bridge protocol
//!
//! Listeners watch the bridge contract on every configured chain and publish
//! finalized protocol events as tasks; dispatcher workers consume the tasks
//! and submit the next protocol step on the counterpart chain.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ethers::signers::LocalWallet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

mod api;
mod broker;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod retry;
mod state;

use broker::{Broker, MemoryBroker, PgBroker};
use chain::listener::Outbox;
use chain::{ChainRegistry, EventListener};
use config::{BrokerBackend, Settings};
use coordination::TaskDispatcher;
use error::RelayerResult;
use events::EventDecoder;
use metrics::MetricsServer;
use state::{EventStore, PgKvStore};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "bridge-relayer", version, about)]
struct Cli {
    /// Configuration environment, loaded from config/{env}.toml
    #[arg(long, env = "RELAYER_ENV", default_value = "dev")]
    env: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listeners for every enabled chain and the dispatcher in one process
    Run {
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Listener for a single chain
    Listen {
        #[arg(long)]
        chain_id: u64,
    },
    /// Dispatcher workers only
    Dispatch {
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Apply database migrations and exit
    Migrate,
}

type Components = JoinSet<(String, RelayerResult<()>)>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    info!("Starting Bridge Relayer v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load(&cli.env).context("failed to load configuration")?;
    info!(
        "Loaded {} configuration for {} chains",
        cli.env,
        settings.enabled_chains().len()
    );

    let kv = Arc::new(
        PgKvStore::new(&settings.database)
            .await
            .context("failed to connect to database")?,
    );
    kv.run_migrations().await?;
    let store = Arc::new(EventStore::new(kv.clone()));

    let broker: Arc<dyn Broker> = match settings.broker.backend {
        BrokerBackend::Memory => {
            if !matches!(cli.command, Command::Run { .. }) {
                warn!("In-memory broker does not connect separate processes; use `run` or the postgres broker");
            }
            Arc::new(MemoryBroker::new())
        }
        BrokerBackend::Postgres => {
            let broker = PgBroker::new(kv.pool().clone(), &settings.broker);
            broker.run_migrations().await?;
            Arc::new(broker)
        }
    };
    info!("Database migrations complete");

    if matches!(cli.command, Command::Migrate) {
        return Ok(());
    }

    let wallet = load_wallet(&settings)?;
    let chains = Arc::new(
        ChainRegistry::connect(&settings, &wallet)
            .await
            .context("failed to connect to chains")?,
    );
    info!("Connected to chains {:?}", chains.chain_ids());

    let (stop, shutdown) = watch::channel(false);
    let mut components = Components::new();

    match cli.command {
        Command::Run { workers } => {
            for (_, chain_config) in settings.enabled_chains() {
                let listener = build_listener(&settings, chain_config.chain_id, &chains, &store, &broker)?;
                spawn_listener(&mut components, listener, chain_config.start_block, shutdown.clone());
            }
            spawn_dispatcher(&mut components, &settings, workers, &store, &chains, &broker, shutdown.clone());
        }
        Command::Listen { chain_id } => {
            let start_block = settings.chain(chain_id)?.start_block;
            let listener = build_listener(&settings, chain_id, &chains, &store, &broker)?;
            spawn_listener(&mut components, listener, start_block, shutdown.clone());
        }
        Command::Dispatch { workers } => {
            spawn_dispatcher(&mut components, &settings, workers, &store, &chains, &broker, shutdown.clone());
        }
        Command::Migrate => unreachable!("handled above"),
    }

    let api_state = api::AppState::new(store.clone(), chains.clone(), broker.clone());
    spawn(&mut components, "api", api::run_server(settings.api.clone(), api_state, shutdown.clone()));

    if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        let rx = shutdown.clone();
        spawn(&mut components, "metrics", async move { server.run(rx).await });
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    spawn(
        &mut components,
        "health",
        health_loop(store.clone(), chains.clone(), broker.clone(), shutdown.clone()),
    );

    info!("Bridge Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);

    // Stop on a signal, or as soon as any component exits on its own
    let mut failure = None;
    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received, stopping..."),
        Some(joined) = components.join_next() => {
            failure = report(joined);
            warn!("A component exited early, stopping...");
        }
    }

    let _ = stop.send(true);
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(joined) = components.join_next().await {
            if let Some(e) = report(joined) {
                failure.get_or_insert(e);
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Components still running after {:?}, aborting", SHUTDOWN_GRACE);
        components.abort_all();
    }

    info!("Bridge Relayer stopped");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn load_wallet(settings: &Settings) -> Result<LocalWallet> {
    let key = std::env::var(&settings.wallet.private_key_env).with_context(|| {
        format!(
            "relayer key not set: export {}",
            settings.wallet.private_key_env
        )
    })?;
    key.trim()
        .parse::<LocalWallet>()
        .context("invalid relayer private key")
}

fn build_listener(
    settings: &Settings,
    chain_id: u64,
    chains: &ChainRegistry,
    store: &Arc<EventStore>,
    broker: &Arc<dyn Broker>,
) -> Result<EventListener> {
    let chain_config = settings.chain(chain_id)?;
    let abi = chain_config.load_abi()?;

    Ok(EventListener::new(
        chains.get(chain_id)?,
        chain_config.contract_address()?,
        EventDecoder::new(chain_id, &abi),
        chain_config.confirmation_depth,
        Outbox::new(store.clone(), broker.clone(), settings.broker.queue.clone()),
        settings.listener.clone(),
    ))
}

fn spawn_listener(
    components: &mut Components,
    listener: EventListener,
    start_block: u64,
    shutdown: watch::Receiver<bool>,
) {
    let name = format!("listener-{}", listener.chain_id());
    spawn(components, name, async move {
        let cursor = listener.load_cursor(start_block).await?;
        listener.run(cursor, shutdown).await
    });
}

fn spawn_dispatcher(
    components: &mut Components,
    settings: &Settings,
    workers: Option<usize>,
    store: &Arc<EventStore>,
    chains: &Arc<ChainRegistry>,
    broker: &Arc<dyn Broker>,
    shutdown: watch::Receiver<bool>,
) {
    let workers = workers.unwrap_or(settings.dispatcher.workers);
    let mut dispatcher = TaskDispatcher::new(
        store.clone(),
        chains.clone(),
        broker.clone(),
        settings.broker.queue.clone(),
        settings.dispatcher.clone(),
        settings.relayer.instance_id.clone(),
    );
    // Nothing outside the process can read an in-memory queue
    if matches!(settings.broker.backend, BrokerBackend::Postgres) {
        dispatcher = dispatcher.with_dead_letter_queue();
    }
    spawn(components, "dispatcher", Arc::new(dispatcher).run(workers, shutdown));
}

fn spawn<F>(components: &mut Components, name: impl Into<String>, task: F)
where
    F: Future<Output = RelayerResult<()>> + Send + 'static,
{
    let name = name.into();
    components.spawn(async move { (name, task.await) });
}

/// Log a finished component; returns its error, if any
fn report(
    joined: Result<(String, RelayerResult<()>), tokio::task::JoinError>,
) -> Option<anyhow::Error> {
    match joined {
        Ok((name, Ok(()))) => {
            info!("{} stopped", name);
            None
        }
        Ok((name, Err(e))) => {
            error!("{} failed: {}", name, e);
            Some(anyhow::Error::new(e).context(name))
        }
        Err(e) => {
            error!("Component panicked: {}", e);
            Some(anyhow::Error::new(e))
        }
    }
}

async fn health_loop(
    store: Arc<EventStore>,
    chains: Arc<ChainRegistry>,
    broker: Arc<dyn Broker>,
    mut shutdown: watch::Receiver<bool>,
) -> RelayerResult<()> {
    let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        }

        for (chain_id, healthy) in chains.health_check().await {
            if !healthy {
                warn!("Chain {} health check failed", chain_id);
            }
        }
        if let Err(e) = store.health_check().await {
            warn!("Store health check failed: {}", e);
        }
        if let Err(e) = broker.health_check().await {
            warn!("Broker health check failed: {}", e);
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,bridge_relayer=debug,sqlx=warn,hyper=warn,tower_http=info")
    });
    let json = std::env::var("RELAYER_LOG_FORMAT").map_or(false, |f| f == "json");

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_current_span(false)))
        .with((!json).then(|| fmt::layer().with_target(true).with_thread_ids(true)))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
