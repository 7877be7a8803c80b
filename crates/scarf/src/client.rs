//! TCP client

use crate::config::ClientConfig;
use crate::connection::{Connection, Role};
use crate::registry::{InvocationRegistry, PendingCall, Reply};
use crate::{Result, ScarfError};
use scarf_proto::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// RPC client over one connection
///
/// Any number of calls and streams may be outstanding at once. Dropping the
/// client closes the connection.
pub struct Client {
    connection: Connection,
    registry: Arc<InvocationRegistry>,
}

impl Client {
    /// Connect with default configuration
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::connect_with_config(addr, ClientConfig::default()).await
    }

    /// Connect with the given configuration
    pub async fn connect_with_config<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> Result<Self> {
        let socket = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ScarfError::Timeout {
                duration: config.connect_timeout,
            })??;
        socket.set_nodelay(config.nodelay)?;

        if let Ok(peer) = socket.peer_addr() {
            info!("Connected to {}", peer);
        }

        Ok(Self::from_stream(socket, &config))
    }

    /// Run the client over an already established byte stream
    pub fn from_stream<S>(socket: S, config: &ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (connection, registry) = Connection::start(
            socket,
            Role::Client,
            &config.connection,
            CancellationToken::new(),
            |outbound, _shutdown| InvocationRegistry::new(outbound),
        );
        Self {
            connection,
            registry,
        }
    }

    /// Send a call and return its pending result
    ///
    /// Fails right away if the connection is already closed.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<PendingCall> {
        self.registry.invoke(method, args).await
    }

    /// Call a method and wait for its result
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Reply> {
        self.call(method, args).await?.await
    }

    /// Call a method and hand its result to `callback`
    pub fn invoke_with_callback<F>(&self, method: &str, args: Vec<Value>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let method = method.to_string();
        tokio::spawn(async move {
            let result = match registry.invoke(&method, args).await {
                Ok(pending) => pending.await,
                Err(e) => Err(e),
            };
            callback(result);
        })
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Number of calls still waiting for a response
    pub async fn pending_count(&self) -> usize {
        self.registry.pending_count().await
    }

    /// Tear the connection down, rejecting everything outstanding
    pub fn close(&self) {
        self.connection.close();
    }

    /// Wait until the connection has been torn down
    pub async fn closed(&self) {
        self.connection.closed().await;
    }

    /// Check if teardown has started
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        debug!("Client dropped, closing connection {}", self.connection.id());
        self.connection.close();
    }
}
