//! Blocking client facade over an asynchronous pvAccess-style transport.
//!
//! Every transport exchange is asynchronous: connects, completions and
//! monitor events arrive as callbacks on transport threads. This crate
//! turns them into blocking `issue_*` / `wait_*` pairs plus one-call
//! conveniences that raise on failure:
//!
//! - **[`PvaClient`]**: the explicit client context. Registers providers,
//!   caches channels by (name, provider) and destroys them all on
//!   [`destroy()`](PvaClient::destroy) or drop.
//!
//! - **[`ClientChannel`]**: one named channel. Connects, reports state
//!   changes to listeners, and caches one request object per distinct
//!   request text for get, put, put-get, process, RPC and monitor.
//!
//! - **Request objects** ([`ClientGet`], [`ClientPut`], [`ClientPutGet`],
//!   [`ClientProcess`], [`ClientRpc`]): thin wrappers over one generic
//!   request state machine with a connect sub-state and an operation
//!   sub-state.
//!
//! - **[`ClientMonitor`]**: subscription lifecycle plus the poll/release
//!   element ownership protocol.
//!
//! - **[`MultiChannel`]** with [`MultiGet`], [`MultiPut`] and
//!   [`MultiMonitor`]: fixed channel sets connected with a partial-success
//!   policy and operated as one, joined as a `f64` array or an
//!   NTMultiChannel structure.
//!
//! - **Data views** ([`GetData`], [`PutData`], [`MonitorData`]): typed
//!   access to received structures through [`ValueView`].

mod cache;
pub mod channel;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod monitor;
pub mod multi;
pub mod request;

// ── Primary re-exports ──────────────────────────────────────────────
pub use channel::{ClientChannel, DEFAULT_GET_REQUEST, DEFAULT_PUT_REQUEST};
pub use config::{ClientConfig, DEFAULT_PROVIDER};
pub use context::PvaClient;
pub use data::{GetData, MonitorData, PutData, ValueView};
pub use error::CoreError;
pub use monitor::{ClientMonitor, MonitorRequester};
pub use multi::{JoinMode, MultiChannel, MultiGet, MultiMonitor, MultiPut};
pub use request::{
    ClientGet, ClientProcess, ClientPut, ClientPutGet, ClientRpc, ConnectPhase, OperationPhase,
};
