// ── Transport capability seam ──
//
// The abstract capability set consumed by pvac-core: create/destroy a
// named channel, create/destroy per-operation request objects against a
// connected channel, and receive asynchronous completions. Each
// asynchronous role gets its own tagged event enum, delivered through a
// callback the transport invokes from its own worker threads.

use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::request::PvRequest;
use crate::status::Status;
use crate::value::{BitSet, PvStructure};

/// Callback through which a transport delivers events of one role.
///
/// Implementations must not block for long: they run on transport
/// worker threads.
pub type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

// ── Channel ──────────────────────────────────────────────────────

/// Connection status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    NeverConnected,
    Connecting,
    Connected,
    Disconnected,
    Destroyed,
}

/// A factory for channels of one protocol flavor.
pub trait ChannelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Create a channel and start searching for it.
    ///
    /// Connection-state changes are reported through `on_state`, starting
    /// with the first connect, which may happen at any later time or never.
    fn create_channel(
        &self,
        name: &str,
        on_state: Callback<ConnectionState>,
    ) -> Result<Arc<dyn Channel>, Error>;
}

/// A named endpoint with its own connection lifecycle.
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    fn provider_name(&self) -> &str;

    fn connection_state(&self) -> ConnectionState;

    /// Create a one-shot request object.
    ///
    /// Creation itself is synchronous; the negotiated shape arrives later
    /// as [`OperationEvent::Connected`].
    fn create_operation(
        &self,
        kind: OperationKind,
        request: &PvRequest,
        events: Callback<OperationEvent>,
    ) -> Result<Arc<dyn Operation>, Error>;

    /// Create a subscription. It does not deliver elements until started.
    fn create_monitor(
        &self,
        request: &PvRequest,
        events: Callback<MonitorEvent>,
    ) -> Result<Arc<dyn Monitor>, Error>;

    fn destroy(&self);
}

// ── One-shot operations ──────────────────────────────────────────

/// Which one-shot exchange a request object performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum OperationKind {
    Get,
    Put,
    PutGet,
    Process,
    Rpc,
}

/// One exchange issued on a connected request object.
#[derive(Debug, Clone)]
pub enum Action {
    /// Read the selected fields.
    Get,
    /// Write the fields marked in `changed`.
    Put { value: PvStructure, changed: BitSet },
    /// Write, then read back the get side.
    PutGet { value: PvStructure, changed: BitSet },
    /// Read the get side.
    GetGet,
    /// Read the put side.
    GetPut,
    Process,
    Rpc { arguments: PvStructure },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Put { .. } => "put",
            Self::PutGet { .. } => "putGet",
            Self::GetGet => "getGet",
            Self::GetPut => "getPut",
            Self::Process => "process",
            Self::Rpc { .. } => "rpc",
        }
    }
}

/// Events delivered for a one-shot request object.
#[derive(Debug, Clone)]
pub enum OperationEvent {
    /// The request object finished connecting.
    ///
    /// `put_shape` is set for put and put-get, `get_shape` for get and
    /// put-get; process and RPC report neither.
    Connected {
        status: Status,
        put_shape: Option<PvStructure>,
        get_shape: Option<PvStructure>,
    },
    /// An issued action completed.
    Completed {
        status: Status,
        value: Option<PvStructure>,
        changed: BitSet,
    },
}

/// A connected one-shot request object.
pub trait Operation: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Start one exchange; completion arrives as [`OperationEvent::Completed`].
    fn issue(&self, action: Action);

    fn destroy(&self);
}

// ── Monitors ─────────────────────────────────────────────────────

/// One queued monitor update.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorElement {
    pub value: PvStructure,
    pub changed: BitSet,
    pub overrun: BitSet,
}

/// Events delivered for a subscription.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Connected {
        status: Status,
        shape: Option<PvStructure>,
    },
    /// At least one element is available to poll.
    Event,
    /// The server ended the stream; no further elements will arrive.
    Unlisten,
}

/// A subscription with a server-side element queue.
pub trait Monitor: Send + Sync {
    fn start(&self) -> Status;

    fn stop(&self) -> Status;

    /// Take ownership of the oldest queued element.
    fn poll(&self) -> Option<MonitorElement>;

    /// Hand an element back so its queue slot can be reused.
    fn release(&self, element: MonitorElement);

    /// Number of queued, not yet polled elements.
    fn pending(&self) -> usize;

    fn destroy(&self);
}

impl fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("provider", &self.provider_name())
            .field("state", &self.connection_state())
            .finish()
    }
}
