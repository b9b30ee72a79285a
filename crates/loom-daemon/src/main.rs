use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use loom_core::config::Config;
use loom_daemon::daemon::Daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match config_path_arg() {
        Some(path) => Config::load_from(&path).with_context(|| format!("loading {path}"))?,
        None => Config::load().context("loading config")?,
    };

    let filter = EnvFilter::try_from_env("LOOM_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_signal();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown.trigger();
        }
    });

    daemon.run().await
}

/// `loom-daemon [--config <path>]`
fn config_path_arg() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}
