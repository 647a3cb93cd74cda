//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to.
    pub bind_addr: SocketAddr,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Root for per-job log files.
    pub data_dir: PathBuf,
    /// Externally reachable base URL, used in relay ingress prefixes.
    /// No trailing slash.
    pub public_url: String,
    /// HS256 secret for user-signed connection tokens. Signed-token auth is
    /// disabled when absent.
    pub token_secret: Option<String>,
}

impl ServerConfig {
    pub fn with_defaults(bind_addr: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            bind_addr,
            database_path: data_dir.join("bellows.db"),
            public_url: format!("http://{}", bind_addr),
            data_dir,
            token_secret: None,
        }
    }
}
