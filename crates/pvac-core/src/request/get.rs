use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pvac_api::{Action, OperationKind, PvRequest, Status};

use super::machine::{CompletionListener, ConnectPhase, OperationPhase, RequestMachine};
use crate::channel::ClientChannel;
use crate::config::wait_limit;
use crate::data::{GetData, ValueView};
use crate::error::CoreError;

/// A get request on one channel.
pub struct ClientGet {
    machine: Arc<RequestMachine>,
    data: Mutex<GetData>,
}

impl ClientGet {
    pub(crate) fn new(channel: &ClientChannel, request: PvRequest) -> Arc<Self> {
        Self::with_listener(channel, request, None)
    }

    pub(crate) fn with_listener(
        channel: &ClientChannel,
        request: PvRequest,
        listener: Option<CompletionListener>,
    ) -> Arc<Self> {
        let machine = RequestMachine::new(channel, OperationKind::Get, request, listener);
        let data = Mutex::new(GetData::new(channel.name(), None));
        Arc::new(Self { machine, data })
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

    pub fn issue_get(&self) -> Result<(), CoreError> {
        self.machine.issue(Action::Get)
    }

    /// Wait for the issued get. On success the data view is replaced by
    /// the received value.
    pub fn wait_get(&self) -> Result<Status, CoreError> {
        let completion = self.machine.wait_default()?;
        if completion.status.is_ok() {
            if let Some(value) = completion.value {
                self.data.lock().replace(value, completion.changed);
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

    /// Snapshot of the data view.
    pub fn data(&self) -> Result<GetData, CoreError> {
        if self.machine.is_destroyed() {
            return Err(self.machine.destroyed_error());
        }
        self.adopt_shape();
        Ok(self.data.lock().clone())
    }

    pub fn destroy(&self) {
        self.machine.destroy();
    }

    /// Seed the view with the negotiated shape until a value arrives.
    fn adopt_shape(&self) {
        let mut data = self.data.lock();
        if data.structure().is_none() {
            if let Some(shape) = self.machine.get_shape() {
                *data = GetData::new(self.machine.channel_name(), Some(shape));
            }
        }
    }
}

impl std::fmt::Debug for ClientGet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientGet")
            .field("channel", &self.channel_name())
            .field("request", &self.request().as_str())
            .field("connect", &self.connect_phase())
            .field("operation", &self.operation_phase())
            .finish()
    }
}
