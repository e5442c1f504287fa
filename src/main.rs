use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;

mod config;
mod db;
mod dispatch;
mod models;
pub mod observability;
mod retention;
mod scheduler;
mod tables;
mod worker;

#[cfg(test)]
mod tests;

/// Config file looked up in the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "das.toml";

/// How long shutdown waits for in-progress cycles to finish launching.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// CLI arguments for the data archival service
#[derive(Parser, Debug)]
#[command(version, about = "Data archival service", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./das.toml if it exists, otherwise
    /// the built-in local development config)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the scheduler (default)
    Serve,
    /// Run one archival or purge unit
    ///
    /// Started by the dispatcher. Reads its parameters from the environment,
    /// not from the config file, and exits 0 on completion or 1 on failure.
    Worker,
    /// Run one archival or purge cycle now and exit
    ///
    /// Uses the configured dispatcher. The overlap guard is local to this
    /// process, so it does not see a cycle a running `serve` has in flight.
    Run {
        /// `archival` or `purge`
        job_type: models::JobType,
    },
    /// Run orchestrator store migrations and exit
    ///
    /// Useful for Kubernetes init containers or CI/CD pipelines.
    Migrate,
    /// Show enabled compile-time features
    Features,
}

/// Configuration used when no config file is found.
fn default_config_toml() -> &'static str {
    r#"# Data archival service: local development defaults

[database]
type = "sqlite"
path = "das.db"

[scheduler]
archival_cron = "0 2 * * *"
purge_cron = "0 3 * * *"
"#
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::Worker) => {
            run_worker().await;
        }
        Some(Command::Run { job_type }) => {
            run_cycle(args.config.as_deref(), job_type).await;
        }
        Some(Command::Migrate) => {
            run_migrate(args.config.as_deref()).await;
        }
        Some(Command::Features) => {
            run_features();
        }
        Some(Command::Serve) | None => {
            run_server(args.config.as_deref()).await;
        }
    }
}

/// Resolve and load the configuration, exiting on error.
fn load_config(explicit_path: Option<&str>) -> config::OrchestratorConfig {
    let path = match explicit_path {
        Some(path) => {
            let path = PathBuf::from(path);
            if !path.exists() {
                eprintln!("Error: Config file not found: {}", path.display());
                std::process::exit(1);
            }
            Some(path)
        }
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };

    let result = match &path {
        Some(path) => config::OrchestratorConfig::from_file(path),
        None => config::OrchestratorConfig::from_str(default_config_toml()),
    };

    match result {
        Ok(config) => config,
        Err(e) => {
            let source = path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in defaults".to_string());
            eprintln!("Failed to load config from {}: {}", source, e);
            std::process::exit(1);
        }
    }
}

fn init_logging(logging: &config::LoggingConfig) -> Option<observability::TracingGuard> {
    match observability::init_tracing(logging) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: Failed to initialize tracing: {}", e);
            None
        }
    }
}

/// Connect to the orchestrator store and bring its schema up to date.
async fn connect_store(config: &config::OrchestratorConfig) -> Arc<db::DbPool> {
    if config.database.is_none() {
        eprintln!(
            "Error: No orchestrator store configured.\n\
             Add a [database] section to your config file."
        );
        std::process::exit(1);
    }

    let pool = match db::DbPool::from_config(&config.database).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to orchestrator store");
            eprintln!("Error: Failed to connect to orchestrator store: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = pool.run_migrations().await {
        tracing::error!(error = %e, "Orchestrator store migrations failed");
        eprintln!("Error: Orchestrator store migrations failed: {}", e);
        std::process::exit(1);
    }
    Arc::new(pool)
}

fn build_scheduler(
    config: &config::OrchestratorConfig,
    db: Arc<db::DbPool>,
) -> scheduler::Scheduler {
    let orchestrator = config.callback_descriptor();
    if orchestrator.is_none() {
        tracing::warn!(
            "Orchestrator store cannot be described to units; \
             executions will stay running until reconciled"
        );
    }

    let context = dispatch::UnitContext {
        orchestrator,
        batch_size: config.scheduler.batch_size,
        connect_timeout_secs: config.scheduler.connect_timeout_secs,
    };
    let dispatcher = match dispatch::from_config(&config.dispatcher, context) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            eprintln!("Error: Failed to configure worker dispatcher: {}", e);
            std::process::exit(1);
        }
    };

    scheduler::Scheduler::new(db, dispatcher, config.scheduler.stale_after_mins)
}

/// Run the scheduler until SIGINT/SIGTERM
async fn run_server(explicit_config_path: Option<&str>) {
    let config = load_config(explicit_config_path);
    let _tracing_guard = init_logging(&config.observability.logging);

    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics: {e}");
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting data archival service");

    let db = connect_store(&config).await;
    let scheduler = build_scheduler(&config, db.clone());

    if config.scheduler.enabled {
        let schedules = (
            config.scheduler.archival_schedule(),
            config.scheduler.purge_schedule(),
        );
        match schedules {
            (Ok(archival), Ok(purge)) => {
                scheduler.start(archival, purge);
                tracing::info!(
                    archival_cron = %config.scheduler.archival_cron,
                    purge_cron = %config.scheduler.purge_cron,
                    "Cycle timers registered"
                );
            }
            (Err(e), _) | (_, Err(e)) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        tracing::info!("Scheduler timers disabled; use `das run <archival|purge>` for cycles");
    }

    shutdown_signal().await;

    tracing::info!("Shutdown signal received, waiting for in-progress cycles...");
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, scheduler.stop()).await {
        Ok(()) => tracing::info!("All cycles completed"),
        Err(_) => tracing::warn!("Timeout waiting for cycles, some launches may not have finished"),
    }
    db.close().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

/// Unit entrypoint. Everything comes from the environment bundle.
async fn run_worker() {
    let _tracing_guard = init_logging(&config::LoggingConfig::default());

    let outcome = worker::run_from_env().await;
    std::process::exit(worker::exit_code(&outcome));
}

/// Run one cycle through the dispatcher and exit
async fn run_cycle(explicit_config_path: Option<&str>, job_type: models::JobType) {
    let config = load_config(explicit_config_path);
    let _tracing_guard = init_logging(&config.observability.logging);

    let db = connect_store(&config).await;
    let scheduler = build_scheduler(&config, db.clone());

    let result = scheduler.trigger_now(job_type).await;
    db.close().await;

    match result {
        Ok(summary) => {
            println!(
                "{} cycle: {} enabled policies, {} units launched, {} launch failures",
                job_type, summary.policies, summary.launched, summary.launch_failures
            );
            if summary.stale_reconciled > 0 {
                println!("{} stale executions marked failed", summary.stale_reconciled);
            }
            std::process::exit(if summary.launch_failures == 0 { 0 } else { 1 });
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_migrate(explicit_config_path: Option<&str>) {
    let config = load_config(explicit_config_path);

    // Minimal observability for migration logging
    let _tracing_guard = init_logging(&config.observability.logging);

    tracing::info!("Running orchestrator store migrations");

    if config.database.is_none() {
        eprintln!("Error: Database is not configured. Nothing to migrate.");
        std::process::exit(1);
    }

    match db::DbPool::from_config(&config.database).await {
        Ok(pool) => match pool.run_migrations().await {
            Ok(()) => {
                tracing::info!("Orchestrator store migrations completed successfully");
                pool.close().await;
                std::process::exit(0);
            }
            Err(e) => {
                tracing::error!(error = %e, "Orchestrator store migrations failed");
                eprintln!("Error: Orchestrator store migrations failed: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to database");
            eprintln!("Error: Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    }
}

fn run_features() {
    let version = env!("CARGO_PKG_VERSION");

    let features: &[(&str, &str, bool)] = &[
        (
            "database-sqlite",
            "Databases",
            cfg!(feature = "database-sqlite"),
        ),
        (
            "database-postgres",
            "Databases",
            cfg!(feature = "database-postgres"),
        ),
        (
            "database-mysql",
            "Databases",
            cfg!(feature = "database-mysql"),
        ),
        ("prometheus", "Observability", cfg!(feature = "prometheus")),
    ];

    let profile = if cfg!(feature = "full") {
        "full"
    } else if cfg!(feature = "minimal") {
        "minimal"
    } else {
        "custom"
    };

    println!("Data archival service v{version}\n");
    println!("Build profile: {profile}");
    match profile {
        "full" => println!("  (full = all database families + prometheus)\n"),
        "minimal" => println!("  (minimal = sqlite only)\n"),
        _ => println!(),
    }

    println!("Compile-time features:");

    let mut current_group = "";
    for &(name, group, enabled) in features {
        if group != current_group {
            if !current_group.is_empty() {
                println!();
            }
            println!("  {group}:");
            current_group = group;
        }
        let status = if enabled { "enabled" } else { "disabled" };
        println!("    {name:<32} {status}");
    }
}
