use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pvac_api::{Action, OperationKind, PvRequest, Status};

use super::machine::{Completion, ConnectPhase, OperationPhase, RequestMachine};
use crate::channel::ClientChannel;
use crate::config::wait_limit;
use crate::data::{GetData, PutData, ValueView};
use crate::error::CoreError;

/// Which exchange the put-get is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    PutGet,
    GetGet,
    GetPut,
}

/// A put followed by a get of a possibly different field set, in one
/// round trip.
///
/// `record[...]putField(...)getField(...)` selects the two sides;
/// a plain `field(...)` request uses the same fields for both.
pub struct ClientPutGet {
    machine: Arc<RequestMachine>,
    sides: Mutex<Sides>,
}

struct Sides {
    put: PutData,
    get: GetData,
    fetched: bool,
    pending: Option<Exchange>,
}

impl ClientPutGet {
    pub(crate) fn new(channel: &ClientChannel, request: PvRequest) -> Arc<Self> {
        let machine = RequestMachine::new(channel, OperationKind::PutGet, request, None);
        let sides = Mutex::new(Sides {
            put: PutData::new(channel.name(), None),
            get: GetData::new(channel.name(), None),
            fetched: false,
            pending: None,
        });
        Arc::new(Self { machine, sides })
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
        self.adopt_shapes();
        Ok(status)
    }

    pub fn connect(&self) -> Result<(), CoreError> {
        self.machine.connect()?;
        self.adopt_shapes();
        Ok(())
    }

    // ── Put then get ─────────────────────────────────────────────

    pub fn issue_put_get(&self) -> Result<(), CoreError> {
        self.ensure_fetched()?;
        let (value, changed) = self.sides.lock().put.snapshot()?;
        self.issue(Exchange::PutGet, Action::PutGet { value, changed })
    }

    pub fn wait_put_get(&self) -> Result<Status, CoreError> {
        self.wait(Exchange::PutGet)
    }

    pub fn put_get(&self) -> Result<(), CoreError> {
        self.issue_put_get()?;
        let status = self.wait_put_get()?;
        self.raise(status)
    }

    // ── Read the get side ────────────────────────────────────────

    pub fn issue_get_get(&self) -> Result<(), CoreError> {
        self.issue(Exchange::GetGet, Action::GetGet)
    }

    pub fn wait_get_get(&self) -> Result<Status, CoreError> {
        self.wait(Exchange::GetGet)
    }

    pub fn get_get(&self) -> Result<(), CoreError> {
        self.issue_get_get()?;
        let status = self.wait_get_get()?;
        self.raise(status)
    }

    // ── Read the put side ────────────────────────────────────────

    pub fn issue_get_put(&self) -> Result<(), CoreError> {
        self.issue(Exchange::GetPut, Action::GetPut)
    }

    pub fn wait_get_put(&self) -> Result<Status, CoreError> {
        self.wait(Exchange::GetPut)
    }

    pub fn get_put(&self) -> Result<(), CoreError> {
        self.issue_get_put()?;
        let status = self.wait_get_put()?;
        self.raise(status)
    }

    // ── Data ─────────────────────────────────────────────────────

    /// Edit the put side in place.
    pub fn update<F>(&self, f: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut PutData) -> Result<(), CoreError>,
    {
        self.ensure_fetched()?;
        f(&mut self.sides.lock().put)
    }

    pub fn put_data(&self) -> Result<PutData, CoreError> {
        self.ensure_fetched()?;
        Ok(self.sides.lock().put.clone())
    }

    pub fn get_data(&self) -> Result<GetData, CoreError> {
        if self.machine.is_destroyed() {
            return Err(self.machine.destroyed_error());
        }
        self.adopt_shapes();
        Ok(self.sides.lock().get.clone())
    }

    pub fn destroy(&self) {
        self.machine.destroy();
    }

    fn issue(&self, exchange: Exchange, action: Action) -> Result<(), CoreError> {
        self.machine.issue(action)?;
        self.sides.lock().pending = Some(exchange);
        Ok(())
    }

    fn wait(&self, expected: Exchange) -> Result<Status, CoreError> {
        let Completion {
            status,
            finished,
            value,
            changed,
        } = self.machine.wait_default()?;
        // A timed-out wait leaves the exchange outstanding.
        if !finished {
            return Ok(status);
        }
        let mut sides = self.sides.lock();
        let exchange = sides.pending.take().unwrap_or(expected);
        if !status.is_ok() {
            return Ok(status);
        }
        match exchange {
            Exchange::PutGet => {
                sides.put.clear_changed();
                if let Some(value) = value {
                    sides.get.replace(value, changed);
                }
            }
            Exchange::GetGet => {
                if let Some(value) = value {
                    sides.get.replace(value, changed);
                }
            }
            Exchange::GetPut => {
                if let Some(value) = value {
                    sides.put.merge(&value, &changed)?;
                    sides.fetched = true;
                }
            }
        }
        Ok(status)
    }

    fn raise(&self, status: Status) -> Result<(), CoreError> {
        if status.is_ok() {
            Ok(())
        } else {
            Err(self.machine.failed(status))
        }
    }

    fn ensure_fetched(&self) -> Result<(), CoreError> {
        if self.machine.is_destroyed() {
            return Err(self.machine.destroyed_error());
        }
        if self.machine.connect_phase() != ConnectPhase::Connected {
            self.connect()?;
        }
        if self.sides.lock().fetched {
            return Ok(());
        }
        self.get_put()
    }

    fn adopt_shapes(&self) {
        let mut sides = self.sides.lock();
        if !sides.fetched && sides.put.structure().is_none() {
            if let Some(shape) = self.machine.put_shape() {
                sides.put = PutData::new(self.machine.channel_name(), Some(shape));
            }
        }
        if sides.get.structure().is_none() {
            if let Some(shape) = self.machine.get_shape() {
                sides.get = GetData::new(self.machine.channel_name(), Some(shape));
            }
        }
    }
}

impl std::fmt::Debug for ClientPutGet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPutGet")
            .field("channel", &self.channel_name())
            .field("request", &self.request().as_str())
            .field("connect", &self.connect_phase())
            .field("operation", &self.operation_phase())
            .finish()
    }
}
