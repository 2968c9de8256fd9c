//! contd - Cont container-control daemon.
//!
//! Listens on a Unix domain socket for `start`/`stop` commands and pulls
//! container images into a local OCI layout on demand.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use cont_core::config::DaemonConfig;
use cont_core::log::LogLevel;
use cont_daemon::{shutdown, CommandHandler, ControlServer, DaemonContext};

/// Cont container-control daemon
#[derive(Parser, Debug)]
#[command(name = "contd", version, about = "Cont container-control daemon")]
struct Args {
    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path of the control socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Directory of the content store (OCI image layout).
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    cont_daemon::logging::init(&config.log).context("Failed to initialize logging")?;

    run(config).await
}

/// Config file (or defaults), then command-line overrides.
///
/// Every path flag accepts a leading `~/`.
fn load_config(args: &Args) -> Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let path = expand_home(path);
            DaemonConfig::load(&path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => DaemonConfig::default(),
    };

    if let Some(ref socket) = args.socket {
        config.socket_path = expand_home(socket);
    }
    if let Some(ref store_dir) = args.store_dir {
        config.store_dir = expand_home(store_dir);
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if let Some(ref file) = args.log_file {
        config.log.file = Some(expand_home(file));
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(config: DaemonConfig) -> Result<()> {
    tracing::info!(
        version = cont_core::VERSION,
        socket = %config.socket_path.display(),
        store = %config.store_dir.display(),
        default_image = %config.default_image,
        "Starting Cont daemon"
    );

    let server = ControlServer::from_config(&config).context("Failed to start control server")?;
    let context = Arc::new(
        DaemonContext::from_config(config).context("Failed to initialize daemon state")?,
    );

    let token = CancellationToken::new();
    shutdown::install(token.clone());

    server
        .serve(CommandHandler::new(context), token)
        .await
        .context("Control server failed")?;

    tracing::info!("Daemon stopped");
    Ok(())
}

/// Expand a leading `~/` to the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> DaemonConfig {
        let args = Args::try_parse_from(std::iter::once("contd").chain(args.iter().copied()))
            .unwrap();
        load_config(&args).unwrap()
    }

    #[test]
    fn test_path_flags_expand_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let config = parse(&[
            "--socket",
            "~/run/cont.sock",
            "--store-dir",
            "~/store",
            "--log-file",
            "~/logs/daemon.log",
        ]);
        assert_eq!(config.socket_path, home.join("run/cont.sock"));
        assert_eq!(config.store_dir, home.join("store"));
        assert_eq!(config.log.file, Some(home.join("logs/daemon.log")));
    }

    #[test]
    fn test_absolute_paths_unchanged() {
        let config = parse(&["--socket", "/tmp/cont.sock", "--log-level", "debug"]);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/cont.sock"));
        assert_eq!(config.log.level, LogLevel::Debug);
    }
}
