use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pvac_api::{Action, OperationKind, PvRequest, Status};

use super::machine::{CompletionListener, ConnectPhase, OperationPhase, RequestMachine};
use crate::channel::ClientChannel;
use crate::config::wait_limit;
use crate::data::{PutData, ValueView};
use crate::error::CoreError;

/// A put request on one channel.
///
/// The first access to the data after connecting fetches the current
/// value, so fields the caller does not touch keep what the record holds.
pub struct ClientPut {
    machine: Arc<RequestMachine>,
    side: Mutex<PutSide>,
}

struct PutSide {
    data: PutData,
    fetched: bool,
}

impl ClientPut {
    pub(crate) fn new(channel: &ClientChannel, request: PvRequest) -> Arc<Self> {
        Self::with_listener(channel, request, None)
    }

    pub(crate) fn with_listener(
        channel: &ClientChannel,
        request: PvRequest,
        listener: Option<CompletionListener>,
    ) -> Arc<Self> {
        let machine = RequestMachine::new(channel, OperationKind::Put, request, listener);
        let side = Mutex::new(PutSide {
            data: PutData::new(channel.name(), None),
            fetched: false,
        });
        Arc::new(Self { machine, side })
    }

    pub fn channel_name(&self) -> &str {
        self.machine.channel_name()
    }

    pub fn request(&self) -> &PvRequest {
        self.machine.request()
    }

    pub fn connect_phase(&self) -> ConnectPhase {
        self.machine.connect_phase()
    }

    pub fn operation_phase(&self) -> OperationPhase {
        self.machine.operation_phase()
    }

    pub fn issue_connect(&self) -> Result<(), CoreError> {
        self.machine.issue_connect()
    }

    /// Zero waits forever.
    pub fn wait_connect(&self, timeout: Duration) -> Result<Status, CoreError> {
        let status = self.machine.wait_connect(wait_limit(timeout))?;
        self.adopt_shape();
        Ok(status)
    }

    pub fn connect(&self) -> Result<(), CoreError> {
        self.machine.connect()?;
        self.adopt_shape();
        Ok(())
    }

    // ── Get side ─────────────────────────────────────────────────

    pub fn issue_get(&self) -> Result<(), CoreError> {
        self.machine.issue(Action::Get)
    }

    /// Wait for an issued get and merge the current value into the put
    /// data, OR-ing its changed bits with those already set.
    pub fn wait_get(&self) -> Result<Status, CoreError> {
        let completion = self.machine.wait_default()?;
        if completion.status.is_ok() {
            if let Some(value) = completion.value {
                let mut side = self.side.lock();
                side.data.merge(&value, &completion.changed)?;
                side.fetched = true;
            }
        }
        Ok(completion.status)
    }

    pub fn get(&self) -> Result<(), CoreError> {
        self.issue_get()?;
        let status = self.wait_get()?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(self.machine.failed(status))
        }
    }

    // ── Put side ─────────────────────────────────────────────────

    /// Send the fields marked as changed.
    pub fn issue_put(&self) -> Result<(), CoreError> {
        self.ensure_fetched()?;
        let (value, changed) = self.side.lock().data.snapshot()?;
        self.machine.issue(Action::Put { value, changed })
    }

    /// Wait for the issued put. A successful put clears the changed bits.
    pub fn wait_put(&self) -> Result<Status, CoreError> {
        let completion = self.machine.wait_default()?;
        if completion.status.is_ok() {
            self.side.lock().data.clear_changed();
        }
        Ok(completion.status)
    }

    pub fn put(&self) -> Result<(), CoreError> {
        self.issue_put()?;
        let status = self.wait_put()?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(self.machine.failed(status))
        }
    }

    /// Edit the put data in place.
    ///
    /// ```ignore
    /// put.update(|data| data.put_double(5.0))?;
    /// put.put()?;
    /// ```
    pub fn update<F>(&self, f: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut PutData) -> Result<(), CoreError>,
    {
        self.ensure_fetched()?;
        f(&mut self.side.lock().data)
    }

    /// Snapshot of the put data.
    pub fn data(&self) -> Result<PutData, CoreError> {
        self.ensure_fetched()?;
        Ok(self.side.lock().data.clone())
    }

    pub fn destroy(&self) {
        self.machine.destroy();
    }

    /// Connect and fetch the current value once.
    fn ensure_fetched(&self) -> Result<(), CoreError> {
        if self.machine.is_destroyed() {
            return Err(self.machine.destroyed_error());
        }
        if self.machine.connect_phase() != ConnectPhase::Connected {
            self.connect()?;
        }
        if self.side.lock().fetched {
            return Ok(());
        }
        self.get()
    }

    fn adopt_shape(&self) {
        let mut side = self.side.lock();
        if side.fetched || side.data.structure().is_some() {
            return;
        }
        if let Some(shape) = self.machine.put_shape() {
            side.data = PutData::new(self.machine.channel_name(), Some(shape));
        }
    }
}

impl std::fmt::Debug for ClientPut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPut")
            .field("channel", &self.channel_name())
            .field("request", &self.request().as_str())
            .field("connect", &self.connect_phase())
            .field("operation", &self.operation_phase())
            .finish()
    }
}
