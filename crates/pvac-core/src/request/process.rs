use std::sync::Arc;
use std::time::Duration;

use pvac_api::{Action, OperationKind, PvRequest, Status};

use super::machine::{ConnectPhase, OperationPhase, RequestMachine};
use crate::channel::ClientChannel;
use crate::config::wait_limit;
use crate::error::CoreError;

/// Ask the record to process, without exchanging data.
pub struct ClientProcess {
    machine: Arc<RequestMachine>,
}

impl ClientProcess {
    pub(crate) fn new(channel: &ClientChannel, request: PvRequest) -> Arc<Self> {
        let machine = RequestMachine::new(channel, OperationKind::Process, request, None);
        Arc::new(Self { machine })
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
        self.machine.wait_connect(wait_limit(timeout))
    }

    pub fn connect(&self) -> Result<(), CoreError> {
        self.machine.connect()
    }

    pub fn issue_process(&self) -> Result<(), CoreError> {
        self.machine.issue(Action::Process)
    }

    pub fn wait_process(&self) -> Result<Status, CoreError> {
        Ok(self.machine.wait_default()?.status)
    }

    pub fn process(&self) -> Result<(), CoreError> {
        self.machine.execute(Action::Process).map(|_| ())
    }

    pub fn destroy(&self) {
        self.machine.destroy();
    }
}

impl std::fmt::Debug for ClientProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProcess")
            .field("channel", &self.channel_name())
            .field("request", &self.request().as_str())
            .finish_non_exhaustive()
    }
}
