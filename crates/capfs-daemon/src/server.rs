//! capfs server - serves a local directory over a Unix socket

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use capfs_core::MainView;

use crate::local::{BackendOptions, LocalBackend, LocalNode};
use crate::net::{bind_socket, ConnectionError};
use crate::rpc::RpcConnection;

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub socket: PathBuf,
    pub max_connections: usize,
    pub backend: BackendOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            socket: PathBuf::from("capfs.sock"),
            max_connections: 64,
            backend: BackendOptions::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("cannot serve {path:?}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot listen on {path:?}: {source}")]
    Listen {
        path: PathBuf,
        #[source]
        source: ConnectionError,
    },
}

/// Serves one root directory to every client that connects
pub struct FsServer {
    config: ServerConfig,
    backend: Arc<LocalBackend>,
    connection_semaphore: Arc<Semaphore>,
}

impl FsServer {
    /// Open the configured root. Fails if it cannot be stat'ed.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let root = LocalNode::open(&config.root)
            .map_err(|source| ServerError::Root {
                path: config.root.clone(),
                source,
            })?
            .with_options(config.backend);

        Ok(Self {
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections.max(1))),
            backend: Arc::new(LocalBackend::new(root)),
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind(&self) -> Result<UnixListener, ServerError> {
        bind_socket(&self.config.socket).map_err(|source| ServerError::Listen {
            path: self.config.socket.clone(),
            source,
        })
    }

    /// Bind the configured socket and serve until the task is dropped.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve_listener(listener).await;
        Ok(())
    }

    /// Accept connections forever. A failing connection never stops the
    /// server.
    pub async fn serve_listener(&self, listener: UnixListener) {
        info!(
            "capfs serving {:?} on {:?}",
            self.config.root, self.config.socket
        );

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let permit = match self.connection_semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("connection limit reached");
                    continue;
                }
            };

            let backend: Arc<dyn MainView> = self.backend.clone();
            tokio::spawn(async move {
                handle_connection(stream, backend).await;
                drop(permit);
            });
        }
    }
}

/// Run one client connection to completion
async fn handle_connection(stream: UnixStream, backend: Arc<dyn MainView>) {
    info!("Got connection");
    let conn = RpcConnection::new(stream, Some(backend));
    conn.closed().await;
    info!("Client disconnected");
}
