//! Server and middleware error types.

use roomcast_settings::SettingsError;
use thiserror::Error;

/// Errors surfaced by [`Server::start`](crate::Server::start).
///
/// Everything that happens after the listener is bound is logged and
/// isolated to the affected connection instead.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Settings failed validation; nothing was bound.
    #[error("invalid configuration: {0}")]
    Config(#[from] SettingsError),
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// Certificate or key could not be loaded.
    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),
    /// `start` was called on a server that already started.
    #[error("server already started")]
    AlreadyStarted,
    /// The Prometheus recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Metrics(String),
}

/// Errors a middleware can end a chain run with.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MiddlewareError {
    /// The middleware refused the message.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The middleware panicked; the payload text is kept.
    #[error("panicked: {0}")]
    Panicked(String),
}
