use std::io;

use thiserror::Error;

/// Raised only during socket setup. After setup, socket errors are state
/// (the endpoint flips to disconnected), not errors.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("socket configuration incomplete: {0}")]
    MissingConfig(&'static str),
    #[error("socket create failed: {0}")]
    CreateFailure(#[source] io::Error),
    #[error("host resolution failed for {host}: {source}")]
    HostFailure {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {addr} failed: {source}")]
    ConnectFailure {
        addr: String,
        #[source]
        source: io::Error,
    },
}
