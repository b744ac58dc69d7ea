use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::ipfilter::IpRange;

pub const DEFAULT_PORT: u16 = 38008;

/// Size of the transfer buffer used for streaming reads and writes.
pub const DEFAULT_BUFFER_SIZE: usize = 65535;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory all served paths are confined under.
    pub root: PathBuf,

    pub listen_addr: SocketAddr,

    /// Per-command deadline on the command channel. The connection is torn
    /// down when it expires. Zero disables the deadline.
    pub read_timeout: Duration,

    /// Concurrent connection cap enforced at accept time (`0` disables).
    pub max_clients: usize,

    /// Optional client IP allowlist checked at accept time.
    pub client_whitelist: Option<IpRange>,

    /// Unless set, all modifying operations reply with an error.
    pub allow_write: bool,

    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            read_timeout: Duration::from_secs(600),
            max_clients: 0,
            client_whitelist: None,
            allow_write: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}
