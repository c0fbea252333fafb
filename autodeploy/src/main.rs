//! autodeploy - webhook receiver
//!
//! Runs unprivileged. Admits push events from a git forge, re-signs them as
//! minimal sync messages and hands them to `autodeployd` over its socket.

#![forbid(unsafe_code)]

mod cgi;
mod http;
mod receiver;

use anyhow::{Context, Result, bail};
use autodeploy_common::{
    Config, DEFAULT_CONFIG_PATH, LogConfig, Message, init_logging, send_message,
};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use receiver::Receiver;

#[derive(Parser)]
#[command(name = "autodeploy")]
#[command(
    author,
    version,
    about = "autodeploy webhook receiver - forwards signed push events to the deploy daemon"
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "AUTODEPLOY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable debug output
    #[arg(short = 'd', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the standalone HTTP server
    Serve {
        /// Port to listen on (defaults to daemon.web_port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,
    },

    /// Handle a single delivery as a CGI program
    Cgi,

    /// Sign and send a sync request without a webhook
    Send {
        /// Repository as owner/name
        #[arg(long)]
        repo: String,

        /// Full ref, e.g. refs/heads/main
        #[arg(long)]
        branch: String,

        /// Commit the checkout is expected to be at
        #[arg(long)]
        before: String,

        /// Commit to deploy
        #[arg(long)]
        state: String,

        #[arg(long, default_value = "")]
        pusher_login: String,

        #[arg(long, default_value = "")]
        pusher_name: String,

        #[arg(long, default_value = "")]
        pusher_email: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    // stdout belongs to the CGI response, so logs always go to stderr.
    let mut log_config = LogConfig::from_settings(&config.daemon).with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _log_guards = init_logging(&log_config)?;

    let config = Arc::new(config);
    match cli.command {
        Commands::Serve { port, bind } => {
            let addr = SocketAddr::new(bind, port.unwrap_or(config.daemon.web_port));
            let state = http::HttpState {
                receiver: Arc::new(Receiver::new(config)),
                version: env!("CARGO_PKG_VERSION"),
                started_at: Instant::now(),
            };
            http::run(state, addr).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cgi => {
            cgi::run(&Receiver::new(config)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Send {
            repo,
            branch,
            before,
            state,
            pusher_login,
            pusher_name,
            pusher_email,
        } => {
            let Some(section) = config.repo(&repo) else {
                bail!("Repository {repo} is not configured");
            };
            let payload = Message::new(&repo, branch, before, state)
                .with_pusher(pusher_login, pusher_name, pusher_email)
                .sign(section.secret.expose())?;
            let reply = send_message(
                config.socket_for(&repo),
                &payload,
                config.daemon.client_timeout(),
            )
            .await?;

            print!("{}", reply.body);
            if reply.success {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
