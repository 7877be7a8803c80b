//! TCP server
//!
//! Every accepted socket gets its own [`Connection`] and dispatcher; all of
//! them share one read-only [`MethodTable`].

use crate::config::ServerConfig;
use crate::connection::{Connection, Role};
use crate::dispatcher::Dispatcher;
use crate::methods::MethodTable;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed `accept` before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// RPC server exposing a method table
#[derive(Debug, Clone)]
pub struct Server {
    methods: Arc<MethodTable>,
    config: ServerConfig,
}

impl Server {
    /// Create a server with default configuration
    pub fn new(methods: MethodTable) -> Self {
        Self::with_config(methods, ServerConfig::default())
    }

    /// Create a server with the given configuration
    pub fn with_config(methods: MethodTable, config: ServerConfig) -> Self {
        Self {
            methods: Arc::new(methods),
            config,
        }
    }

    /// Get the method table
    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    /// Get the configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind a TCP listener and start accepting connections
    pub async fn listen<A: ToSocketAddrs>(&self, addr: A) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        info!("Listening on {} ({} methods)", local_addr, self.methods.len());

        let accept_task = tokio::spawn(self.clone().accept_loop(listener, shutdown.clone()));

        Ok(ServerHandle {
            local_addr,
            shutdown,
            accept_task: Some(accept_task),
        })
    }

    /// Serve one already established byte stream
    pub fn serve<S>(&self, socket: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.serve_with(socket, CancellationToken::new())
    }

    fn serve_with<S>(&self, socket: S, shutdown: CancellationToken) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let methods = Arc::clone(&self.methods);
        let stream_window = self.config.connection.stream_window;
        let (connection, _dispatcher) = Connection::start(
            socket,
            Role::Server,
            &self.config.connection,
            shutdown,
            move |outbound, shutdown| Dispatcher::new(methods, outbound, stream_window, shutdown),
        );
        connection
    }

    async fn accept_loop(self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    if let Err(e) = socket.set_nodelay(self.config.nodelay) {
                        warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let connection = self.serve_with(socket, shutdown.child_token());
                    info!("Accepted connection {} from {}", connection.id(), peer);
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        debug!("Listener stopped accepting");
    }
}

/// Handle onto a listening server
///
/// Dropping the handle closes the listener and its connections.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every connection accepted by this listener
    pub fn close(&self) {
        info!("Closing listener on {}", self.local_addr);
        self.shutdown.cancel();
    }

    /// Check if the listener was closed
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close the listener and wait for the accept loop to exit
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(accept_task) = self.accept_task.take() {
            if let Err(e) = accept_task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            debug!("Server handle dropped, closing listener on {}", self.local_addr);
        }
        self.shutdown.cancel();
    }
}
