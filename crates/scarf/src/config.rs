//! Client and server configuration

use scarf_proto::MAX_FRAME_SIZE;
use std::time::Duration;

/// Per-connection settings shared by both roles
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest frame body accepted or produced
    pub max_frame_size: usize,
    /// Capacity of the outgoing frame queue
    ///
    /// Senders wait once this many frames are queued for the writer, which
    /// is where stream writers feel backpressure from the socket.
    pub write_buffer: usize,
    /// Chunks a caller may have in flight on one writable stream
    ///
    /// Applied by the serving side, which grants one further chunk each time
    /// its sink has taken one; a slow sink therefore suspends the caller.
    pub stream_window: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            write_buffer: 64,
            stream_window: 16,
        }
    }
}

impl ConnectionConfig {
    /// Set the maximum frame size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Set the outgoing queue capacity (at least 1)
    pub fn with_write_buffer(mut self, write_buffer: usize) -> Self {
        self.write_buffer = write_buffer.max(1);
        self
    }

    /// Set the writable stream window (at least 1)
    pub fn with_stream_window(mut self, stream_window: u32) -> Self {
        self.stream_window = stream_window.max(1);
        self
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Settings for every accepted connection
    pub connection: ConnectionConfig,
    /// Disable Nagle's algorithm on accepted sockets
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Set connection settings
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Enable/disable TCP_NODELAY
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection settings
    pub connection: ConnectionConfig,
    /// Time allowed for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            connect_timeout: Duration::from_secs(30),
            nodelay: true,
        }
    }
}

impl ClientConfig {
    /// Set connection settings
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable/disable TCP_NODELAY
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}
