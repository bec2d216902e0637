// ── One-shot request objects ──
//
// Every kind is a thin wrapper over the shared `RequestMachine`: it picks
// the action to issue and folds the completion into its data view.

mod get;
pub(crate) mod machine;
mod process;
mod put;
mod put_get;
mod rpc;

pub use self::get::ClientGet;
pub use self::machine::{ConnectPhase, OperationPhase};
pub use self::process::ClientProcess;
pub use self::put::ClientPut;
pub use self::put_get::ClientPutGet;
pub use self::rpc::ClientRpc;
