//! autodeploy - privileged sync daemon
//!
//! Listens on a local Unix socket for signed sync requests from the webhook
//! receiver, verifies them against its own copy of the configuration and
//! resets the configured checkouts to the requested commits.

#![forbid(unsafe_code)]

mod git;
mod locks;
mod notify;
mod postscript;
mod runner;
mod server;
mod sync;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use autodeploy_common::{
    Config, DEFAULT_CONFIG_PATH, DaemonSettings, LogConfig, SharedConfig, init_logging,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use notify::ConfiguredNotifier;
use runner::ProcessRunner;
use sync::SyncService;

#[derive(Parser)]
#[command(name = "autodeployd")]
#[command(
    author,
    version,
    about = "autodeploy daemon - syncs local checkouts to signed push requests"
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "AUTODEPLOY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listen on this socket instead of the configured one
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Enable debug output
    #[arg(short = 'd', long)]
    verbose: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    if cli.check_config {
        println!(
            "{}: OK, {} repositories",
            cli.config.display(),
            config.repos.len()
        );
        for (name, repo) in &config.repos {
            let kind = if repo.bare { "bare" } else { "checkout" };
            println!("  {name} -> {} ({kind})", repo.local.display());
        }
        return Ok(());
    }

    let mut log_config = LogConfig::from_settings(&config.daemon);
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _log_guards = init_logging(&log_config)?;

    info!("Starting autodeploy daemon {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Loaded {} repositories from {}",
        config.repos.len(),
        cli.config.display()
    );

    let socket = cli
        .socket
        .clone()
        .unwrap_or_else(|| config.daemon.socket.clone());
    let notifier = ConfiguredNotifier::from_settings(&config.daemon);
    let service = SyncService::new(
        SharedConfig::new(config),
        Arc::new(ProcessRunner),
        Arc::new(notifier),
    );

    let listener = server::bind_socket(&socket)?;
    info!("Listening on {}", socket.display());

    let shutdown = CancellationToken::new();
    let terminate = signal(SignalKind::terminate())?;
    let hangup = signal(SignalKind::hangup())?;
    tokio::spawn(watch_signals(
        terminate,
        hangup,
        cli.config.clone(),
        service.config().clone(),
        shutdown.clone(),
    ));

    server::serve(listener, service, shutdown).await;

    server::remove_socket(&socket);
    info!("autodeploy daemon stopped");
    Ok(())
}

/// SIGTERM and SIGINT stop the daemon, SIGHUP reloads the configuration.
///
/// A reload swaps the repository table and the per-request `[daemon]` limits
/// (git binary, git and post-script timeouts). The socket, logging and mail
/// settings are read once at startup.
async fn watch_signals(
    mut terminate: Signal,
    mut hangup: Signal,
    config_path: PathBuf,
    config: SharedConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT");
                break;
            }
            _ = hangup.recv() => reload(&config_path, &config),
        }
    }
    shutdown.cancel();
}

fn reload(path: &Path, config: &SharedConfig) {
    match Config::load(path) {
        Ok(fresh) => {
            info!(
                "Reloaded {} ({} repositories)",
                path.display(),
                fresh.repos.len()
            );
            let ignored = restart_only_changes(&config.snapshot().daemon, &fresh.daemon);
            if !ignored.is_empty() {
                warn!(
                    "Changes to daemon.{} take effect after a restart",
                    ignored.join(", daemon.")
                );
            }
            config.replace(fresh);
        }
        Err(e) => warn!("Reload failed, keeping the previous configuration: {}", e),
    }
}

/// `[daemon]` keys that differ but only apply at startup.
fn restart_only_changes(running: &DaemonSettings, fresh: &DaemonSettings) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if running.socket != fresh.socket {
        changed.push("socket");
    }
    if running.log_level != fresh.log_level {
        changed.push("log_level");
    }
    if running.log_location != fresh.log_location {
        changed.push("log_location");
    }
    if running.log_json != fresh.log_json {
        changed.push("log_json");
    }
    if running.sendmail != fresh.sendmail {
        changed.push("sendmail");
    }
    if running.mail_from != fresh.mail_from {
        changed.push("mail_from");
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn daemon(text: &str) -> DaemonSettings {
        Config::from_toml_str(text).unwrap().daemon
    }

    #[test]
    fn test_restart_only_changes_ignores_per_request_limits() {
        let running = daemon("[daemon]\ngit_timeout_secs = 300\n");
        let fresh = daemon("[daemon]\ngit_timeout_secs = 60\npostscript_timeout_secs = 30\n");
        assert!(restart_only_changes(&running, &fresh).is_empty());
    }

    #[test]
    fn test_restart_only_changes_lists_startup_keys() {
        let running = daemon("[daemon]\n");
        let fresh = daemon(
            "[daemon]\nsocket = \"/run/other.sock\"\nsendmail = \"/usr/sbin/sendmail\"\n",
        );
        assert_eq!(restart_only_changes(&running, &fresh), ["socket", "sendmail"]);
    }

    #[test]
    fn test_reload_swaps_repositories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autodeploy.toml");
        let shared = SharedConfig::new(Config::default());
        std::fs::write(
            &path,
            "[repos.\"acme/site\"]\nsecret = \"s3cr3t\"\nlocal = \"/srv/site\"\nbranch = \"main\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        reload(&path, &shared);
        assert!(shared.snapshot().repo("acme/site").is_some());

        std::fs::write(&path, "not = [valid").unwrap();
        reload(&path, &shared);
        assert!(shared.snapshot().repo("acme/site").is_some());
    }
}
