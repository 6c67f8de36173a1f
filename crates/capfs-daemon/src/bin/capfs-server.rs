//! capfs Server
//!
//! Serves one local directory as a capability filesystem on a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! capfs-server --path /srv/share --socket /run/capfs.sock
//!
//! # Or through the environment
//! CAPFS_PATH=/srv/share CAPFS_SOCKET=/run/capfs.sock capfs-server
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use capfs_daemon::{FsServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "capfs-server")]
#[command(about = "Serve a local directory over the capfs capability protocol")]
#[command(version)]
struct Args {
    /// Path to directory to serve
    #[arg(long, env = "CAPFS_PATH")]
    path: PathBuf,

    /// Path to unix socket to listen on
    #[arg(long, env = "CAPFS_SOCKET")]
    socket: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let config = ServerConfig {
        root: args.path,
        socket: args.socket,
        ..ServerConfig::default()
    };

    let server = match FsServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let listener = match server.bind() {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        _ = server.serve_listener(listener) => {}
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    let _ = std::fs::remove_file(&server.config().socket);
    ExitCode::SUCCESS
}
