use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use frame_channel::CommunicationChannel;
use progress_sdk::{
    ApiClient, ApiConfig, CachedMapCatalog, CompletionStore, FileLevelHintStore, HttpCompletionStore,
    HttpMapSource, InMemoryCompletionStore, LevelHintStore, MapCatalog, StaticMapSource,
};
use sim_host_core::config::HostConfig;
use sim_host_core::logging::{self, LogConfig, LogLevel, Subsystem};
use sim_host_core::{
    BridgeError, FrameBridge, Reconciler, SessionEvent, SessionSettings, SimulatorSession,
};
use sim_proto::Program;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "sim-host", about = "Drive the embedded robot simulator and record learner progress", version)]
struct Cli {
    #[arg(long, global = true, env = "SIM_HOST_CONFIG", value_name = "PATH", help = "Path to a TOML config file")]
    config: Option<PathBuf>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "SIM_HOST_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(long = "log-file", global = true, value_name = "PATH", env = "SIM_HOST_LOG_FILE")]
    file: Option<PathBuf>,

    #[arg(
        long = "verbose",
        value_enum,
        value_delimiter = ',',
        global = true,
        env = "SIM_HOST_VERBOSE",
        help = "Subsystems to log at debug level (channel, session, reconcile, bridge, host, catalog, api)"
    )]
    verbose: Vec<Subsystem>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the frame bridge and keep a session attached to the simulator.
    Run(RunArgs),
    /// Attach to the simulator and print its current status.
    Status,
    /// Print the ids of maps the learner has completed.
    Completed,
    /// Refresh the map catalog and print how many maps it holds.
    Maps,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Map to load once the simulator is ready.
    #[arg(long)]
    map: Option<String>,

    /// Program (JSON) to run after the map loads. The command exits once it wins or loses.
    #[arg(long, value_name = "PATH", requires = "map")]
    program: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.logging.level,
        file: cli.logging.file.clone(),
        verbose: cli.logging.verbose.clone(),
    })?;

    let config = HostConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Status => status(config).await,
        Command::Completed => {
            let (_, store) = progress_backends(&config)?;
            let mut ids: Vec<_> = store.completed_map_ids().await?.into_iter().collect();
            ids.sort();
            for id in ids {
                println!("{id}");
            }
            Ok(())
        }
        Command::Maps => {
            let (catalog, _) = progress_backends(&config)?;
            let count = catalog.refresh().await?;
            println!("{count} maps");
            Ok(())
        }
    }
}

/// HTTP-backed catalog and store when an API is configured, in-memory otherwise.
fn progress_backends(
    config: &HostConfig,
) -> anyhow::Result<(Arc<dyn MapCatalog>, Arc<dyn CompletionStore>)> {
    match &config.api_base_url {
        Some(base) => {
            let api = ApiConfig::new(base)?.with_bearer_token(config.api_token.clone());
            let client = ApiClient::new(api)?;
            let catalog: Arc<dyn MapCatalog> = CachedMapCatalog::new(HttpMapSource::new(client.clone()));
            let store: Arc<dyn CompletionStore> = HttpCompletionStore::new(client);
            Ok((catalog, store))
        }
        None => {
            warn!(target: "sim.host", "api base url not set; progress is kept in memory only");
            let catalog: Arc<dyn MapCatalog> = CachedMapCatalog::new(StaticMapSource::new(Vec::new()));
            let store: Arc<dyn CompletionStore> = InMemoryCompletionStore::new();
            Ok((catalog, store))
        }
    }
}

struct HostRuntime {
    session: Arc<SimulatorSession>,
    serve: JoinHandle<Result<(), BridgeError>>,
}

impl HostRuntime {
    async fn start(config: &HostConfig) -> anyhow::Result<Self> {
        let (bridge, listener) = FrameBridge::bind(&config.bridge_addr).await?;
        let serve = tokio::spawn(Arc::clone(&bridge).serve(listener));

        let (catalog, store) = progress_backends(config)?;
        let hints: Arc<dyn LevelHintStore> = FileLevelHintStore::in_dir(config.state_dir());
        let reconciler = Arc::new(
            Reconciler::new(catalog, store)
                .with_hints(Arc::clone(&hints))
                .with_location(bridge.clone())
                .with_settings(config.reconciler_settings()),
        );
        match reconciler.prime().await {
            Ok(count) => info!(target: "sim.host", completed = count, "loaded completed maps"),
            Err(err) => warn!(target: "sim.host", error = %err, "could not load completed maps"),
        }

        let channel = CommunicationChannel::new(bridge, config.channel_config());
        let session = SimulatorSession::new(
            channel,
            SessionSettings {
                element_id: config.frame_id.clone(),
                attach_retry: config.attach_policy(),
                request_timeout: config.request_timeout(),
            },
            Some(reconciler),
            Some(hints),
        );
        tokio::spawn(log_events(session.events()));
        Ok(Self { session, serve })
    }

    /// Attaches, retrying until a shim announces the frame.
    async fn attach(&self) {
        while let Err(err) = self.session.connect().await {
            info!(target: "sim.host", error = %err, "simulator frame not attached yet");
            tokio::time::sleep(CONNECT_BACKOFF).await;
        }
    }

    fn shutdown(self) {
        self.session.disconnect();
        self.serve.abort();
    }
}

async fn run(config: HostConfig, args: RunArgs) -> anyhow::Result<()> {
    let program = match &args.program {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read program {}", path.display()))?;
            Some(serde_json::from_str::<Program>(&raw).context("program is not valid JSON")?)
        }
        None => None,
    };

    let runtime = HostRuntime::start(&config).await?;
    let result = tokio::select! {
        result = drive(&runtime, args.map.as_deref(), program) => result,
        _ = tokio::signal::ctrl_c() => {
            info!(target: "sim.host", "interrupted");
            Ok(())
        }
    };
    runtime.shutdown();
    result
}

async fn drive(runtime: &HostRuntime, map: Option<&str>, program: Option<Program>) -> anyhow::Result<()> {
    runtime.attach().await;
    let session = &runtime.session;

    if let Some(map) = map {
        session.subscribe().wait_for(|state| state.ready).await?;
        session.load_map(map).await?;
        println!("loaded {map}");
    }

    match program {
        Some(program) => {
            let events = session.events();
            session.run_program(program).await?;
            report_outcome(events).await
        }
        None => {
            std::future::pending::<()>().await;
            Ok(())
        }
    }
}

/// Prints the first victory or defeat, and for a victory the reconciliation that follows it.
async fn report_outcome(mut events: broadcast::Receiver<SessionEvent>) -> anyhow::Result<()> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Victory(view)) => println!("victory: {}", view.message),
            Ok(SessionEvent::Reconciled(outcome)) => {
                println!("progress: {outcome:?}");
                return Ok(());
            }
            Ok(SessionEvent::Defeat(view)) => {
                println!("{}: {}", view.title, view.message);
                return Ok(());
            }
            Ok(SessionEvent::Ready) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => anyhow::bail!("session closed before the program finished"),
        }
    }
}

async fn status(config: HostConfig) -> anyhow::Result<()> {
    let runtime = HostRuntime::start(&config).await?;
    let result = tokio::select! {
        result = async {
            runtime.attach().await;
            runtime.session.get_status().await
        } => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };
    runtime.shutdown();
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Ready) => info!(target: "sim.host", "simulator ready"),
            Ok(SessionEvent::Victory(view)) => {
                info!(target: "sim.host", map_key = ?view.map_key, progress = ?view.progress, "victory")
            }
            Ok(SessionEvent::Defeat(view)) => {
                info!(target: "sim.host", category = ?view.category, reason = %view.reason, "defeat")
            }
            Ok(SessionEvent::Reconciled(outcome)) => {
                info!(target: "sim.host", outcome = ?outcome, "progress reconciled")
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: "sim.host", skipped, "session event log lagged")
            }
            Err(RecvError::Closed) => break,
        }
    }
}
