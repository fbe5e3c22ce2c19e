//! Heartland Marathon - incremental area intelligence runs.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use heartland_marathon::ai::AiClient;
use heartland_marathon::collector::{Collector, CollectorPool, HttpCollector};
use heartland_marathon::config::{ConfigLoader, MarathonConfig};
use heartland_marathon::dashboard::{AppState, DashboardServer};
use heartland_marathon::display;
use heartland_marathon::pipeline::{Orchestrator, RunStatus};
use heartland_marathon::store::{default_store_path, KnowledgeStore};

#[derive(Parser)]
#[command(
    name = "heartland-marathon",
    about = "Incremental, event-sourced area intelligence runs",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to a config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Do not truncate long values in output.
    #[arg(long, global = true)]
    raw: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API.
    Serve {
        /// Address to bind.
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the pipeline for an entity and print its events.
    Run {
        entity: String,
    },
    /// List recorded runs.
    Runs {
        #[arg(short, long)]
        entity: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the latest result for an entity.
    Show {
        entity: String,
    },
    /// Show an entity's change log.
    Changelog {
        entity: String,
    },
    /// Delete an entity's knowledge and run history.
    Clear {
        entity: String,
    },
    /// Generate a dossier for a business topic in an entity.
    Dossier {
        entity: String,
        topic: String,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<MarathonConfig, String> {
    let loader = path.map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    loader.load().map_err(|e| e.to_string())
}

fn build_pool(config: &MarathonConfig) -> Result<CollectorPool, String> {
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::with_capacity(config.collectors.len());
    for collector in &config.collectors {
        let http = HttpCollector::new(collector.clone())
            .map_err(|e| format!("Collector {}: {e}", collector.name))?;
        collectors.push(Arc::new(http));
    }
    tracing::info!(collectors = collectors.len(), "Collectors configured");
    Ok(CollectorPool::new(collectors, config.pool.timeout()))
}

async fn build_orchestrator(config: MarathonConfig) -> Result<Orchestrator, String> {
    let path = config.store.path.clone().unwrap_or_else(default_store_path);
    let store = KnowledgeStore::open(&path)
        .await
        .map_err(|e| format!("Failed to open store {}: {e}", path.display()))?;
    let pool = build_pool(&config)?;

    let orchestrator = match AiClient::from_config(config.ai.clone()) {
        Ok(client) => {
            tracing::info!(model = client.model(), "Generative model configured");
            let client = Arc::new(client);
            Orchestrator::new(store, pool, config)
                .with_reevaluator(client.clone())
                .with_dossier_generator(client)
        }
        Err(e) => {
            tracing::warn!(error = %e, "No generative model, using digest re-evaluation");
            Orchestrator::new(store, pool, config)
        }
    };
    Ok(orchestrator)
}

async fn serve(
    orchestrator: Orchestrator,
    config: MarathonConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), String> {
    let recovered = orchestrator
        .recover_interrupted()
        .await
        .map_err(|e| e.to_string())?;
    if recovered > 0 {
        tracing::warn!(recovered, "Marked interrupted runs as failed");
    }

    let mut server_config = config.server;
    if let Some(host) = host {
        server_config.host = host;
    }
    if let Some(port) = port {
        server_config.port = port;
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    DashboardServer::new(AppState::with_cancel(orchestrator, cancel))
        .with_config(server_config)
        .run()
        .await
        .map_err(|e| e.to_string())
}

async fn run_entity(orchestrator: &Orchestrator, entity: &str, raw: bool) -> Result<(), String> {
    let mut handle = orchestrator
        .start_run(entity)
        .await
        .map_err(|e| e.to_string())?;
    let run_id = handle.run_id;

    loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(event) => display::print_event(&event, raw),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(%run_id, "Interrupted, cancelling run");
                if let Err(e) = orchestrator.cancel(run_id) {
                    tracing::debug!(error = %e, "Run already finished");
                }
            }
        }
    }

    let run = handle.wait().await.map_err(|e| e.to_string())?;
    match run.status {
        RunStatus::Failed => Err(run.error.unwrap_or_else(|| "run failed".to_string())),
        _ => Ok(()),
    }
}

async fn execute(cli: Cli) -> Result<(), String> {
    let config = load_config(cli.config)?;
    let orchestrator = build_orchestrator(config.clone()).await?;
    let raw = cli.raw;

    match cli.command {
        Commands::Serve { host, port } => serve(orchestrator, config, host, port).await,
        Commands::Run { entity } => run_entity(&orchestrator, &entity, raw).await,
        Commands::Runs { entity, limit } => {
            let runs = orchestrator
                .list_runs(entity.as_deref(), limit)
                .await
                .map_err(|e| e.to_string())?;
            display::print_runs(&runs);
            Ok(())
        }
        Commands::Show { entity } => {
            let view = orchestrator
                .latest_result(&entity)
                .await
                .map_err(|e| e.to_string())?;
            display::print_analysis(&view, raw);
            Ok(())
        }
        Commands::Changelog { entity } => {
            let entries = orchestrator
                .change_log(&entity)
                .await
                .map_err(|e| e.to_string())?;
            display::print_change_log(&entries);
            Ok(())
        }
        Commands::Clear { entity } => {
            let removed = orchestrator
                .clear_cache(&entity)
                .await
                .map_err(|e| e.to_string())?;
            if removed {
                println!("Cleared {entity}");
            } else {
                println!("Nothing stored for {entity}");
            }
            Ok(())
        }
        Commands::Dossier { entity, topic } => {
            let dossier = orchestrator
                .generate_dossier(&entity, &topic)
                .await
                .map_err(|e| e.to_string())?;
            display::print_dossier(&dossier);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            display::print_error(&e);
            ExitCode::FAILURE
        }
    }
}
