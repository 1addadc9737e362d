//! Error taxonomy for the connection and dispatch core.
//!
//! Every fallible operation in this crate returns a [`CoreError`] variant
//! drawn from the categories in the design doc's error handling section
//! rather than an ad hoc string, so call sites can branch on
//! [`CoreError::is_client_disconnect`] / [`CoreError::is_fatal_to_server`]
//! instead of re-deriving the taxonomy each time.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Invalid lifecycle transition, or `start()` with no vhosts bound.
    #[error("configuration error: {0}")]
    Configuration(&'static str),

    /// Accept-time or TLS handshake failure. Always per-connection.
    #[error("accept/tls error: {0}")]
    Accept(#[from] io::Error),

    /// The peer went away. Never fatal; applications may ignore it.
    #[error("client disconnected")]
    ClientDisconnect,

    /// An application handler (or filter) raised an error.
    #[error("application error in filter {filter_key:?}: {message}")]
    Application {
        filter_key: Option<&'static str>,
        message: String,
    },

    /// An observer's `update` callback returned an error.
    #[error("observer error: {0}")]
    Observer(String),

    /// `stop()` did not complete within `shutdown_timeout`.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(std::time::Duration),
}

impl CoreError {
    /// Whether this error represents the peer disappearing rather than a
    /// bug in the server. Such errors are logged, not escalated.
    pub fn is_client_disconnect(&self) -> bool {
        matches!(self, CoreError::ClientDisconnect)
    }

    /// Whether this error should abort a server lifecycle transition
    /// (only observer failures during STARTING/STARTED do).
    pub fn is_fatal_to_server(&self) -> bool {
        matches!(self, CoreError::Observer(_) | CoreError::Configuration(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
