use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use pvac_api::{Action, OperationKind, PvRequest, PvStructure, Status};
use tracing::warn;

use super::machine::{Completion, CompletionListener, ConnectPhase, RequestMachine};
use crate::channel::ClientChannel;
use crate::config::wait_limit;
use crate::error::CoreError;

type ResponseCallback = Box<dyn FnOnce(Result<PvStructure, CoreError>) + Send>;

/// Remote procedure call: send an argument structure, receive a result
/// structure.
pub struct ClientRpc {
    machine: Arc<RequestMachine>,
    response_timeout: Mutex<Duration>,
    pending: Mutex<Option<ResponseCallback>>,
}

impl ClientRpc {
    pub(crate) fn new(channel: &ClientChannel, request: PvRequest) -> Arc<Self> {
        let response_timeout = channel.config().operation_timeout;
        Arc::new_cyclic(|me: &Weak<Self>| {
            let me = me.clone();
            let listener: CompletionListener = Arc::new(move |_: &Status| {
                if let Some(rpc) = me.upgrade() {
                    rpc.deliver();
                }
            });
            Self {
                machine: RequestMachine::new(channel, OperationKind::Rpc, request, Some(listener)),
                response_timeout: Mutex::new(response_timeout),
                pending: Mutex::new(None),
            }
        })
    }

    pub fn channel_name(&self) -> &str {
        self.machine.channel_name()
    }

    pub fn request_spec(&self) -> &PvRequest {
        self.machine.request()
    }

    pub fn connect_phase(&self) -> ConnectPhase {
        self.machine.connect_phase()
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

    pub fn response_timeout(&self) -> Duration {
        *self.response_timeout.lock()
    }

    /// How long [`request`](Self::request) waits. Zero waits forever.
    pub fn set_response_timeout(&self, timeout: Duration) {
        *self.response_timeout.lock() = timeout;
    }

    /// Send `arguments` and block for the response.
    pub fn request(&self, arguments: PvStructure) -> Result<PvStructure, CoreError> {
        self.machine.issue(Action::Rpc { arguments })?;
        let completion = self
            .machine
            .wait_completion(wait_limit(self.response_timeout()))?;
        self.response(completion)
    }

    /// Send `arguments`; `callback` receives the response on a transport
    /// thread.
    pub fn request_with<F>(&self, arguments: PvStructure, callback: F) -> Result<(), CoreError>
    where
        F: FnOnce(Result<PvStructure, CoreError>) + Send + 'static,
    {
        {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                return Err(CoreError::AlreadyActive {
                    channel: self.channel_name().to_owned(),
                    operation: "rpc".into(),
                });
            }
            *pending = Some(Box::new(callback));
        }
        if let Err(e) = self.machine.issue(Action::Rpc { arguments }) {
            self.pending.lock().take();
            return Err(e);
        }
        Ok(())
    }

    pub fn destroy(&self) {
        self.machine.destroy();
        if let Some(callback) = self.pending.lock().take() {
            callback(Err(self.machine.destroyed_error()));
        }
    }

    fn response(&self, completion: Completion) -> Result<PvStructure, CoreError> {
        if !completion.status.is_ok() {
            return Err(self.machine.failed(completion.status));
        }
        completion.value.ok_or_else(|| CoreError::NoData {
            channel: self.channel_name().to_owned(),
            operation: "rpc".into(),
        })
    }

    /// Hand a finished exchange to the waiting callback, if any.
    fn deliver(&self) {
        let Some(callback) = self.pending.lock().take() else {
            return;
        };
        match self.machine.wait_completion(Some(Duration::ZERO)) {
            Ok(completion) => callback(self.response(completion)),
            Err(e) => {
                warn!(channel = %self.channel_name(), error = %e, "rpc response lost");
                callback(Err(e));
            }
        }
    }
}

impl std::fmt::Debug for ClientRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRpc")
            .field("channel", &self.channel_name())
            .field("request", &self.request_spec().as_str())
            .finish_non_exhaustive()
    }
}
