//! sshc-tun: keep the tunnel chain of a remote open on a local port
//!
//! Loads the remotes file, brings up the chain and local bridge of the
//! selected remote and blocks until Ctrl-C or SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use sshcompose::config::RemotesStorage;
use sshcompose::executor::tunnel::run_tunnel;
use sshcompose::logging;

#[derive(Parser)]
#[command(name = "sshc-tun")]
#[command(author, version, about = "Open the tunnel chain of a remote")]
struct Cli {
    /// Remote to tunnel to (defaults to the configured default remote)
    remote: Option<String>,

    /// Path to the remotes file
    #[arg(short, long, env = "SSHC_REMOTES")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(logging::level_for(cli.quiet, cli.verbose));

    let storage = match cli.config {
        Some(path) => RemotesStorage::with_path(path),
        None => match RemotesStorage::new() {
            Ok(storage) => storage,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
    };

    let remotes = match storage.load().await {
        Ok(remotes) => remotes,
        Err(e) => {
            error!("Failed to load {}: {}", storage.path().display(), e);
            return ExitCode::FAILURE;
        }
    };

    let (name, remote) = match remotes.select(cli.remote.as_deref()) {
        Ok((name, remote)) => (name, remote.clone()),
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match run_tunnel(&name, remote).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Error on setup of the tunnel chain: {}", e);
            ExitCode::FAILURE
        }
    }
}
