use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use metric_collector::{
    api,
    collector::Collector,
    config::Config,
    logging,
    registry::{BuildContext, Plugins},
    scheduler::{self, Trigger},
    telemetry::Telemetry,
    Result,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

#[derive(Debug, Parser)]
#[command(name = "collector", version, about = "Scheduled metrics collection agent")]
struct Cli {
    /// Log level for process events.
    #[arg(long, env = "COLLECTOR_LOG_LEVEL", default_value = "info", global = true)]
    log_level: Level,

    /// Emit process events as JSON.
    #[arg(long, env = "COLLECTOR_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Work with a single config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run every config on its schedule until interrupted.
    Run {
        /// Config file, or a directory of config files.
        #[arg(short, long, env = "COLLECTOR_CONFIG")]
        config: PathBuf,

        /// Serve self-telemetry on this address.
        #[arg(long, env = "COLLECTOR_METRICS_ADDR")]
        metrics_addr: Option<SocketAddr>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Parse and resolve a config without opening connections.
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run one collection cycle.
    Invoke {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_tracing(cli.log_level, cli.log_json);

    let logger = logging::setup_logger("collector");
    let ctx = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(ctx.clone()));

    let result = match cli.command {
        Command::Config {
            action: ConfigAction::Validate { config },
        } => validate(config, logger).await,
        Command::Config {
            action: ConfigAction::Invoke { config },
        } => invoke(config, logger, ctx).await,
        Command::Run {
            config,
            metrics_addr,
        } => run(config, metrics_addr, logger, ctx).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "collector failed");
            ExitCode::FAILURE
        }
    }
}

async fn cancel_on_ctrl_c(ctx: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received, shutting down");
        ctx.cancel();
    }
}

async fn validate(path: PathBuf, logger: slog::Logger) -> Result<()> {
    let ctx = BuildContext::new(logger).validate_only(true);
    let config = Config::from_file(&path, &ctx, &Plugins::default()).await?;
    info!(config = %config.name, path = %path.display(), "config is valid");
    Ok(())
}

async fn invoke(path: PathBuf, logger: slog::Logger, ctx: CancellationToken) -> Result<()> {
    let build = BuildContext::new(logger.clone());
    let config = Config::from_file(&path, &build, &Plugins::default()).await?;
    let collector = Collector::new(config, logger, None);

    let result = collector.invoke(&ctx).await;
    collector.shutdown().await;
    let invocation = result?;
    info!(
        invocation = %invocation.id,
        metrics = invocation.metrics.len(),
        delivered = ?invocation.delivered,
        "invocation complete"
    );
    Ok(())
}

async fn run(
    path: PathBuf,
    metrics_addr: Option<SocketAddr>,
    logger: slog::Logger,
    ctx: CancellationToken,
) -> Result<()> {
    let telemetry = Arc::new(Telemetry::new()?);
    let build = BuildContext::new(logger.clone());
    let configs = Config::load(&path, &build, &Plugins::default()).await?;
    info!(configs = configs.len(), path = %path.display(), "configs loaded");

    let mut tasks = JoinSet::new();
    if let Some(addr) = metrics_addr {
        let (telemetry, ctx) = (telemetry.clone(), ctx.clone());
        tasks.spawn(async move {
            if let Err(err) = api::serve(addr, telemetry, ctx).await {
                error!(error = %err, "telemetry server stopped");
            }
        });
    }

    for config in configs {
        let trigger = Trigger::try_from(&config.schedule)?;
        let collector = Arc::new(Collector::new(config, logger.clone(), Some(telemetry.clone())));
        let ctx = ctx.clone();
        tasks.spawn(async move {
            scheduler::run(collector.clone(), trigger, ctx).await;
            collector.shutdown().await;
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "collector task panicked");
        }
    }
    Ok(())
}
