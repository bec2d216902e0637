// ── Loopback provider ──
//
// An in-process transport implementing the full capability seam against
// in-memory records. Callbacks are delivered from a private tokio runtime,
// never from the thread that issued the request, so the blocking client
// sees the same threading it would against a network provider.

mod channel;
mod dispatch;
mod monitor;
mod record;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info};

use self::channel::LoopbackChannel;
pub use self::record::RpcHandler;
use self::record::{Database, Record};
use crate::error::Error;
use crate::status::Status;
use crate::transport::{Callback, Channel, ChannelProvider, ConnectionState};
use crate::value::nt::{nt_scalar, nt_scalar_array};
use crate::value::{PvField, PvStructure, Scalar, ScalarArray};

/// Provider name used by [`LoopbackProvider::default_name`].
pub const LOOPBACK_PROVIDER: &str = "loopback";

pub(crate) struct Shared {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    db: Database,
    connect_delay: Mutex<Duration>,
    /// Operation and monitor handles destroyed so far.
    released: AtomicU64,
}

impl Shared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn note_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

/// In-memory channel provider.
///
/// Records are created up front (or later, which connects any channel
/// already searching for that name). A channel whose record never appears
/// stays unconnected forever, which is how a missing server looks on the
/// wire.
#[derive(Clone)]
pub struct LoopbackProvider {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LoopbackProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackProvider")
            .field("name", &self.shared.name)
            .field("records", &self.shared.db.names())
            .finish_non_exhaustive()
    }
}

impl LoopbackProvider {
    /// Create a provider registered under `name`, with its own worker runtime.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("pvac-loopback")
            .enable_time()
            .build()
            .map_err(|e| Error::Runtime(e.to_string()))?;
        let name = name.into();
        info!(provider = %name, "loopback provider started");
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                handle: runtime.handle().clone(),
                runtime: Mutex::new(Some(runtime)),
                db: Database::default(),
                connect_delay: Mutex::new(Duration::ZERO),
                released: AtomicU64::new(0),
            }),
        })
    }

    /// Create a provider named [`LOOPBACK_PROVIDER`].
    pub fn default_name() -> Result<Self, Error> {
        Self::new(LOOPBACK_PROVIDER)
    }

    // ── Records ──────────────────────────────────────────────────

    pub fn add_record(&self, name: &str, value: PvStructure) -> Result<(), Error> {
        debug!(record = %name, "adding record");
        self.shared.db.insert(Record::new(name, value, None))
    }

    /// Add an `NTScalar` record holding `value`.
    pub fn add_scalar(&self, name: &str, value: impl Into<Scalar>) -> Result<(), Error> {
        self.add_record(name, nt_scalar(value.into()))
    }

    /// Add an `NTScalarArray` record holding `value`.
    pub fn add_scalar_array(&self, name: &str, value: ScalarArray) -> Result<(), Error> {
        self.add_record(name, nt_scalar_array(value))
    }

    /// Add a record that serves RPC requests through `handler`.
    pub fn add_rpc<F>(&self, name: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(&PvStructure) -> Result<PvStructure, Status> + Send + Sync + 'static,
    {
        let handler: RpcHandler = Arc::new(handler);
        self.shared
            .db
            .insert(Record::new(name, PvStructure::default(), Some(handler)))
    }

    /// Remove a record. Attached channels disconnect and go back to
    /// searching; subscriptions receive an unlisten.
    pub fn remove_record(&self, name: &str) -> Result<(), Error> {
        self.shared.db.remove(name)
    }

    /// Take a record off the air or bring it back.
    pub fn set_online(&self, name: &str, online: bool) -> Result<(), Error> {
        let record = self.record(name)?;
        for channel in record.set_online(online) {
            channel.record_online(online);
        }
        debug!(record = %name, online, "record availability changed");
        Ok(())
    }

    /// Server-side update of one field, notifying subscribers.
    pub fn write(&self, name: &str, path: &str, field: impl Into<PvField>) -> Result<(), Error> {
        self.record(name)?.write_field(path, &field.into())
    }

    /// Snapshot of a record's full value.
    pub fn value(&self, name: &str) -> Option<PvStructure> {
        self.shared.db.get(name).map(|r| r.snapshot())
    }

    pub fn is_online(&self, name: &str) -> Option<bool> {
        self.shared.db.get(name).map(|r| r.is_online())
    }

    /// How many times a record has been processed.
    pub fn process_count(&self, name: &str) -> Option<u64> {
        self.shared.db.get(name).map(|r| r.process_count())
    }

    /// Operation and monitor handles destroyed so far. Each handle counts
    /// once, however often it is destroyed.
    pub fn released_handles(&self) -> u64 {
        self.shared.released.load(Ordering::Relaxed)
    }

    pub fn record_names(&self) -> Vec<String> {
        self.shared.db.names()
    }

    /// Delay applied before each connect notification of channels created
    /// from now on.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock() = delay;
    }

    fn record(&self, name: &str) -> Result<Arc<Record>, Error> {
        self.shared
            .db
            .get(name)
            .ok_or_else(|| Error::RecordNotFound(name.to_owned()))
    }
}

impl ChannelProvider for LoopbackProvider {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn create_channel(
        &self,
        name: &str,
        on_state: Callback<ConnectionState>,
    ) -> Result<Arc<dyn Channel>, Error> {
        let delay = *self.shared.connect_delay.lock();
        let channel = LoopbackChannel::new(name, Arc::clone(&self.shared), on_state, delay);
        self.shared.db.search(&channel);
        Ok(channel)
    }
}
