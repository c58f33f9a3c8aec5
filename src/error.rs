//! Error types for the endpoint-resolution and socket-setup collaborators.
//!
//! Mirrors the teacher's `config::ConfigError`: a small enum per fallible
//! subsystem with a hand-written `Display`/`Error` impl, no `anyhow`/
//! `thiserror`. Paths that map 1:1 onto an OS error use `std::io::Error`
//! directly instead (see `net::socket`).

use std::fmt;

/// Failure resolving a `host:port` string into a concrete [`crate::net::Endpoint`].
#[derive(Debug)]
pub enum ResolveError {
    /// The string had no `:` to separate host from port.
    MissingPort(String),
    /// The OS resolver rejected the host/port pair.
    Lookup(String, std::io::Error),
    /// The resolver returned zero addresses.
    NoAddresses(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::MissingPort(s) => {
                write!(f, "'{s}' has no ':' separating host and port")
            }
            ResolveError::Lookup(s, e) => write!(f, "failed to resolve '{s}': {e}"),
            ResolveError::NoAddresses(s) => write!(f, "resolution of '{s}' returned no addresses"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Failure creating and configuring a listening or client socket.
#[derive(Debug)]
pub enum SetupError {
    /// `socket()`, `bind()`, `listen()`, or a `setsockopt()` call failed.
    Io(std::io::Error),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::Io(e) => write!(f, "socket setup failed: {e}"),
        }
    }
}

impl std::error::Error for SetupError {}

impl From<std::io::Error> for SetupError {
    fn from(e: std::io::Error) -> Self {
        SetupError::Io(e)
    }
}

impl From<SetupError> for std::io::Error {
    fn from(e: SetupError) -> Self {
        match e {
            SetupError::Io(io_err) => io_err,
        }
    }
}
