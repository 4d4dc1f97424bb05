//! HTTP server configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP address to bind to
    pub bind_addr: SocketAddr,

    /// Unix socket path; when set, takes precedence over TCP
    pub unix_path: Option<PathBuf>,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_clients: usize,

    /// Value for Access-Control-Allow-Origin (empty = no CORS header)
    pub allow_origin: String,

    /// Serve `GET /` from this directory instead of the built-in page
    pub static_dir: Option<PathBuf>,

    /// Basic-auth credentials; both must be set to enable auth
    pub user: Option<String>,
    pub passwd: Option<String>,

    /// Bytes a stream client may leave unsent before being dropped
    pub stream_client_buffer: usize,

    /// Minimum interval between stream parts per client
    pub stream_interval: Duration,

    /// Enable TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,

    /// Report this resolution in `/state` instead of the real one
    pub fake_resolution: Option<(u32, u32)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().expect("static addr"),
            unix_path: None,
            max_clients: 0,
            allow_origin: String::new(),
            static_dir: None,
            user: None,
            passwd: None,
            stream_client_buffer: 4 * 1024 * 1024,
            stream_interval: Duration::ZERO,
            tcp_nodelay: true,
            fake_resolution: None,
        }
    }
}

impl ServerConfig {
    /// Create a config with a custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allow_origin = origin.into();
        self
    }

    pub fn stream_client_buffer(mut self, bytes: usize) -> Self {
        self.stream_client_buffer = bytes;
        self
    }

    pub fn stream_interval(mut self, interval: Duration) -> Self {
        self.stream_interval = interval;
        self
    }

    pub fn basic_auth(mut self, user: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.passwd = Some(passwd.into());
        self
    }

    /// Whether requests must carry basic-auth credentials
    pub fn auth_enabled(&self) -> bool {
        self.user.is_some() && self.passwd.is_some()
    }
}
