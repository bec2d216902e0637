use thiserror::Error;

/// Top-level error type for the `pvac-api` crate.
///
/// Covers every failure the transport seam can report synchronously:
/// provider lookup, request parsing, value introspection and conversion,
/// and loopback record management. Asynchronous failures travel as a
/// [`Status`](crate::Status) inside completion events instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // ── Provider / channel ──────────────────────────────────────────
    /// No provider registered under this name.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// The channel was destroyed and can no longer create requests.
    #[error("channel '{0}' was destroyed")]
    ChannelDestroyed(String),

    /// The channel is not connected.
    #[error("channel '{0}' is not connected")]
    ChannelNotConnected(String),

    // ── Request specification ───────────────────────────────────────
    /// The request string could not be parsed.
    #[error("invalid request '{request}' at position {position}: {reason}")]
    InvalidRequest {
        request: String,
        position: usize,
        reason: String,
    },

    // ── Introspection / conversion ──────────────────────────────────
    /// A field path did not resolve against a structure.
    #[error("field '{0}' not found")]
    FieldNotFound(String),

    /// A field had a different kind than the caller required.
    #[error("type mismatch on '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    /// Two fields are not copy-compatible.
    #[error("cannot convert {from} to {to}")]
    Incompatible { from: String, to: String },

    // ── Loopback records ────────────────────────────────────────────
    /// A record with this name already exists.
    #[error("record '{0}' already exists")]
    RecordExists(String),

    /// No record with this name exists.
    #[error("record '{0}' not found")]
    RecordNotFound(String),

    /// The endpoint does not support this operation kind.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// The loopback worker runtime could not be started.
    #[error("runtime error: {0}")]
    Runtime(String),
}
