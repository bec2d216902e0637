//! Transport seam and value model for the pvac blocking client.
//!
//! This crate holds everything the client layer consumes from below:
//!
//! - **Value model** ([`value`]): introspectable structured data
//!   ([`PvStructure`], [`PvField`], [`Scalar`], [`ScalarArray`]), field
//!   offsets, [`BitSet`] change masks and copy conversion.
//!
//! - **[`PvRequest`]**: the parsed field-selection language
//!   (`"field(value,alarm)"`, `"record[process=true]field(value)"`, ...).
//!
//! - **Transport capability** ([`transport`]): the [`ChannelProvider`],
//!   [`Channel`], [`Operation`] and [`Monitor`] traits plus the event enums
//!   through which completions arrive on transport threads.
//!
//! - **[`LoopbackProvider`]**: an in-process provider backed by in-memory
//!   records, used by tests and by anything that wants the client without
//!   a network.

pub mod error;
pub mod loopback;
pub mod request;
pub mod status;
pub mod transport;
pub mod value;

// ── Primary re-exports ──────────────────────────────────────────────
pub use error::Error;
pub use loopback::{LOOPBACK_PROVIDER, LoopbackProvider, RpcHandler};
pub use request::{FieldSelection, PvRequest};
pub use status::{Status, StatusType};
pub use transport::{
    Action, Callback, Channel, ChannelProvider, ConnectionState, Monitor, MonitorElement,
    MonitorEvent, Operation, OperationEvent, OperationKind,
};
pub use value::{
    BitSet, PvField, PvStructure, Scalar, ScalarArray, ScalarType, convert_field,
    is_copy_compatible,
};
