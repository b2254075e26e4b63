use clap::{Parser, Subcommand};
use opsdesk::config::AppConfig;
use opsdesk::scheduler::HeartbeatScheduler;
use opsdesk::store::{JobStore, PostgresJobStore};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "opsdesk", about = "Admission control and job scheduling for an autonomous trading desk")]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config")]
    config_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the maintenance daemon (heartbeat scheduler)
    Run,
    /// Load and validate configuration, then exit
    CheckConfig,
    /// Run pending database migrations, then exit
    Migrate,
    /// Print a desk activity snapshot, then exit
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;
    // The guard flushes the file appender on drop; keep it for the whole run.
    let _log_guard = init_logging(&config);

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("invalid configuration: {}", e);
        }
        anyhow::bail!("configuration invalid ({} problem(s))", errors.len());
    }

    match cli.command {
        Commands::CheckConfig => {
            info!("configuration OK");
            Ok(())
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await?;
            info!("migrations applied");
            Ok(())
        }
        Commands::Stats => {
            let store = connect(&config).await?;
            let stats = store.system_stats().await?;
            println!("{:#?}", stats);
            Ok(())
        }
        Commands::Run => run_daemon(config).await,
    }
}

async fn run_daemon(config: AppConfig) -> anyhow::Result<()> {
    let store = Arc::new(connect(&config).await?);
    store.migrate().await?;
    info!("connected to database, schema up to date");

    let scheduler = Arc::new(HeartbeatScheduler::with_standard_ops(
        store.clone() as Arc<dyn JobStore>,
        config.scheduler.clone(),
        vec![],
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = {
        let scheduler = scheduler.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(rx).await })
    };

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;

    info!("opsdesk stopped");
    Ok(())
}

async fn connect(config: &AppConfig) -> anyhow::Result<PostgresJobStore> {
    Ok(PostgresJobStore::new(&config.database.url, config.database.max_connections).await?)
}

fn init_logging(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.logging.level)));

    if let Some(dir) = &config.logging.dir {
        let appender = tracing_appender::rolling::daily(dir, "opsdesk.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false);
        if config.logging.json {
            builder.json().init();
        } else {
            builder.init();
        }
        return Some(guard);
    }

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
    None
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
