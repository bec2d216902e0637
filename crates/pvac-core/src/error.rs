// ── Core error types ──
//
// Errors raised to callers of the blocking facade. Transport statuses are
// never surfaced bare: every variant that wraps one also names the channel
// and the operation it came from. The `From<pvac_api::Error>` impl
// translates transport-layer errors into these variants.

use pvac_api::Status;
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("{channel} {operation} connect failed: {status}")]
    ConnectFailed {
        channel: String,
        operation: String,
        status: Status,
    },

    #[error("channel {channel} is not connected")]
    NotConnected { channel: String },

    #[error("unknown provider '{provider}'")]
    UnknownProvider { provider: String },

    // ── Protocol / state errors ──────────────────────────────────────
    #[error("{channel} {operation} is already active")]
    AlreadyActive { channel: String, operation: String },

    #[error("{channel} {operation} was not issued")]
    NotActive { channel: String, operation: String },

    #[error("{channel} {operation}: {reason}")]
    IllegalState {
        channel: String,
        operation: String,
        reason: String,
    },

    #[error("{channel} {operation}: no data received yet")]
    NoData { channel: String, operation: String },

    #[error("{channel} monitor poll: did not release last element")]
    DidNotRelease { channel: String },

    #[error("{channel} monitor release: no element was polled")]
    NotPolled { channel: String },

    #[error("{channel} monitor was not started")]
    NotStarted { channel: String },

    #[error("multi-channel connect already issued")]
    ConnectAlreadyIssued,

    // ── Operation errors ─────────────────────────────────────────────
    #[error("{channel} {operation} failed: {status}")]
    OperationFailed {
        channel: String,
        operation: String,
        status: Status,
    },

    // ── Aggregate errors ─────────────────────────────────────────────
    #[error("only {connected} channels connected, {required} required")]
    ConnectCount { connected: usize, required: usize },

    #[error("array length {found} does not match {expected} channels")]
    ArrayLength { expected: usize, found: usize },

    #[error("channel {index} ({channel}) incompatible: {reason}")]
    IncompatibleType {
        index: usize,
        channel: String,
        reason: String,
    },

    // ── Post-destroy ─────────────────────────────────────────────────
    #[error("{channel} {operation} was destroyed")]
    Destroyed { channel: String, operation: String },

    // ── Type access ──────────────────────────────────────────────────
    #[error("type mismatch on '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("field '{field}' not found")]
    FieldNotFound { field: String },

    #[error("cannot convert {from} to {to}")]
    Incompatible { from: String, to: String },

    // ── Request / cache ──────────────────────────────────────────────
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("{channel}: '{request}' is already cached")]
    DuplicateCacheEntry { channel: String, request: String },

    #[error("operation not supported: {operation}")]
    Unsupported { operation: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<pvac_api::Error> for CoreError {
    fn from(err: pvac_api::Error) -> Self {
        match err {
            pvac_api::Error::UnknownProvider(provider) => CoreError::UnknownProvider { provider },
            pvac_api::Error::ChannelDestroyed(channel) => CoreError::Destroyed {
                channel,
                operation: "channel".into(),
            },
            pvac_api::Error::ChannelNotConnected(channel) => CoreError::NotConnected { channel },
            e @ pvac_api::Error::InvalidRequest { .. } => CoreError::InvalidRequest {
                message: e.to_string(),
            },
            pvac_api::Error::FieldNotFound(field) => CoreError::FieldNotFound { field },
            pvac_api::Error::TypeMismatch {
                field,
                expected,
                found,
            } => CoreError::TypeMismatch {
                field,
                expected,
                found,
            },
            pvac_api::Error::Incompatible { from, to } => CoreError::Incompatible { from, to },
            pvac_api::Error::Unsupported(operation) => CoreError::Unsupported { operation },
            e @ (pvac_api::Error::RecordExists(_)
            | pvac_api::Error::RecordNotFound(_)
            | pvac_api::Error::Runtime(_)) => CoreError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_translate() {
        let err: CoreError = pvac_api::Error::ChannelNotConnected("pv".into()).into();
        assert_eq!(err, CoreError::NotConnected { channel: "pv".into() });

        let err: CoreError = pvac_api::PvRequest::parse("field(").unwrap_err().into();
        assert!(matches!(err, CoreError::InvalidRequest { .. }));
    }

    #[test]
    fn messages_name_channel_and_operation() {
        let err = CoreError::OperationFailed {
            channel: "exampleDouble".into(),
            operation: "put".into(),
            status: Status::error("rejected"),
        };
        assert_eq!(err.to_string(), "exampleDouble put failed: ERROR: rejected");
    }
}
