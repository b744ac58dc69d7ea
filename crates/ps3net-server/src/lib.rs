#![forbid(unsafe_code)]

//! TCP server for the ps3netsrv protocol.
//!
//! [`start_server`] binds a listener and serves each accepted connection as
//! an independent, strictly sequential session over the filesystem core in
//! `ps3net-fs`. See `ps3net-proto` for the wire format.

mod config;
mod ipfilter;
mod server;
mod session;

pub use config::{ServerConfig, DEFAULT_BUFFER_SIZE, DEFAULT_PORT};
pub use ipfilter::{IpRange, IpRangeParseError};
pub use server::{start_server, ServerHandle};
