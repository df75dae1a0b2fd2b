//! sockecho: a UNIX domain socket echo backend.
//!
//! Stands in for an application server when testing HTTP-like clients and
//! proxies. Each connection sends one request frame; everything after the
//! first blank line (`\r\n\r\n`) is written back, then the connection is
//! closed.
//!
//! - `listener`: socket lifecycle and the per-connection exchange
//! - `framing`: separator search, frame split and bounded reads
//! - `stats`: diagnostic counters
//! - `config`: CLI arguments and TOML configuration file
//! - `embed`: build-time text-to-C-source helper used by `embed-text`

pub mod config;
pub mod embed;
pub mod framing;
pub mod listener;
pub mod stats;

pub use config::Config;
pub use listener::{EchoListener, ListenerError, ServerHandle, StopHandle};
