// ── Runtime client configuration ──
//
// Describes timeouts and defaults for the blocking facade. Never touches
// disk: pvac-config (or the embedder) builds a `ClientConfig` and hands it
// to the context.

use std::time::Duration;

use serde::Serialize;

/// Provider used when a channel is created without naming one.
pub const DEFAULT_PROVIDER: &str = "pva";

/// Configuration shared by every component created from one context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientConfig {
    /// Provider for channels created without an explicit one.
    pub default_provider: String,
    /// How long `connect()` waits for a channel or request to connect.
    pub connect_timeout: Duration,
    /// How long a blocking operation waits for its completion.
    /// Zero waits forever.
    pub operation_timeout: Duration,
    /// Queue size requested for monitors whose request does not set
    /// `record[queueSize=N]`.
    pub monitor_queue_size: Option<usize>,
    /// Per-iteration timeout of the multi-channel connect loop.
    pub multi_connect_timeout: Duration,
    /// Minimum channels a multi-channel connect must reach.
    /// `None` requires every channel.
    pub min_connect: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_provider: DEFAULT_PROVIDER.into(),
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::ZERO,
            monitor_queue_size: None,
            multi_connect_timeout: Duration::from_secs(5),
            min_connect: None,
        }
    }
}

/// `None` for a zero duration, which means "wait forever".
pub(crate) fn wait_limit(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() { None } else { Some(timeout) }
}
