//! Load Balancer Sync Daemon
//!
//! Main entry point for the lbsyncd daemon.

use anyhow::Context;
use clap::Parser;
use lbsyncd::{
    spawn_aging_timer, AgingEngine, Daemon, ExitController, LbsyncConfig, MetricsCollector,
    Tables, UdpPeerTransport, UnixControlSource, DEFAULT_CONFIG_PATH,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Load balancer registry sync and connection aging daemon
#[derive(Parser, Debug)]
#[command(name = "lbsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("lbsyncd: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("lbsyncd: Starting load balancer sync daemon");

    match run_daemon(args).await {
        Ok(()) => {
            info!("lbsyncd: Daemon exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "lbsyncd: Daemon exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set logger")?;
    Ok(())
}

async fn run_daemon(args: Args) -> anyhow::Result<()> {
    let config = LbsyncConfig::load_or_default(&args.config)?;
    config.validate()?;
    info!(path = %args.config.display(), "lbsyncd: Configuration loaded");

    let exit = ExitController::new();
    setup_signal_handlers(exit.clone());

    let metrics = MetricsCollector::new().context("metrics registry")?;
    let tables = Arc::new(Tables::prepare(&config.tables));
    let source = UnixControlSource::connect(&config.control).context("control source")?;

    let transport = Arc::new(UdpPeerTransport::new(config.state_sync.peer_addr));
    let engine = Arc::new(
        AgingEngine::new(
            tables.clone(),
            &config.aging,
            transport,
            config.state_sync.max_frame_size,
        )
        .with_metrics(metrics.clone()),
    );
    let period = config.aging.job_interval(config.tables.max_conns);
    let aging = spawn_aging_timer(engine, period, exit.token());

    let daemon = Daemon::new(&config, tables, Box::new(source), exit.clone())
        .with_metrics(metrics.clone());

    // the control loop blocks on its socket
    let control = tokio::task::spawn_blocking(move || daemon.run());
    let result = control.await.context("control loop panicked")?;

    exit.shutdown();
    match aging.await {
        Ok(jobs) => info!(jobs, "lbsyncd: Aging timer joined"),
        Err(e) => warn!(error = %e, "lbsyncd: Aging timer failed"),
    }

    match metrics.render() {
        Ok(text) => debug!(metrics = %text, "lbsyncd: Final metrics"),
        Err(e) => warn!(error = %e, "lbsyncd: Failed to render metrics"),
    }

    result.map_err(Into::into)
}

fn setup_signal_handlers(exit: ExitController) {
    tokio::spawn(async move {
        let token = exit.token();
        tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "lbsyncd: Failed to listen for SIGINT");
                    return;
                }
                info!("lbsyncd: Received SIGINT, shutting down");
                exit.shutdown();
            }
            _ = wait_for_sigterm() => {
                info!("lbsyncd: Received SIGTERM, shutting down");
                exit.shutdown();
            }
            _ = token.cancelled() => {}
        }
    });
}

async fn wait_for_sigterm() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "lbsyncd: Failed to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}
