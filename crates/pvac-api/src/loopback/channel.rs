// ── Loopback channels and request objects ──

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::Shared;
use super::dispatch::Dispatcher;
use super::monitor::LoopbackMonitor;
use super::record::Record;
use crate::error::Error;
use crate::request::PvRequest;
use crate::status::Status;
use crate::transport::{
    Action, Callback, Channel, ConnectionState, Monitor, MonitorEvent, Operation, OperationEvent,
    OperationKind,
};
use crate::value::{BitSet, PvStructure};

pub(crate) struct LoopbackChannel {
    me: Weak<LoopbackChannel>,
    name: String,
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    on_state: Callback<ConnectionState>,
    connect_delay: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    state: ConnectionState,
    destroyed: bool,
    record: Option<Arc<Record>>,
    operations: Vec<Weak<LoopbackOperation>>,
    monitors: Vec<Weak<LoopbackMonitor>>,
}

impl LoopbackChannel {
    pub(crate) fn new(
        name: &str,
        shared: Arc<Shared>,
        on_state: Callback<ConnectionState>,
        connect_delay: Duration,
    ) -> Arc<Self> {
        let dispatcher = Dispatcher::spawn(shared.handle());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: name.to_owned(),
            shared,
            dispatcher,
            on_state,
            connect_delay,
            inner: Mutex::new(Inner {
                state: ConnectionState::NeverConnected,
                destroyed: false,
                record: None,
                operations: Vec::new(),
                monitors: Vec::new(),
            }),
        })
    }

    pub(crate) fn name_str(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().state == ConnectionState::Connected
    }

    // ── Record links ─────────────────────────────────────────────

    pub(crate) fn attach(&self, record: &Arc<Record>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.record = Some(Arc::clone(record));
        }
        if record.attach_channel(&me) {
            self.transition(true);
        }
    }

    pub(crate) fn record_online(&self, online: bool) {
        self.transition(online);
    }

    pub(crate) fn record_lost(&self) {
        self.inner.lock().record = None;
        self.transition(false);
    }

    /// Move to connected or disconnected, in order with every other event.
    fn transition(&self, connected: bool) {
        if connected {
            self.dispatcher.pause(self.connect_delay);
        }
        let me = self.me.clone();
        self.dispatcher.post(move || {
            let Some(channel) = me.upgrade() else {
                return;
            };
            let next = {
                let mut inner = channel.inner.lock();
                if inner.destroyed {
                    return;
                }
                let next = match (connected, inner.state) {
                    (true, ConnectionState::Connected) => return,
                    (true, _) => ConnectionState::Connected,
                    (false, ConnectionState::Connected) => ConnectionState::Disconnected,
                    (false, _) => return,
                };
                inner.state = next;
                next
            };
            debug!(channel = %channel.name, state = %next, "loopback channel state");
            (channel.on_state)(next);
        });
    }

    fn connected_record(&self) -> Result<Arc<Record>, Error> {
        let inner = self.inner.lock();
        if inner.destroyed {
            return Err(Error::ChannelDestroyed(self.name.clone()));
        }
        match (&inner.record, inner.state) {
            (Some(record), ConnectionState::Connected) => Ok(Arc::clone(record)),
            _ => Err(Error::ChannelNotConnected(self.name.clone())),
        }
    }
}

impl Channel for LoopbackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_name(&self) -> &str {
        self.shared.name()
    }

    fn connection_state(&self) -> ConnectionState {
        let inner = self.inner.lock();
        if inner.destroyed {
            ConnectionState::Destroyed
        } else {
            inner.state
        }
    }

    fn create_operation(
        &self,
        kind: OperationKind,
        request: &PvRequest,
        events: Callback<OperationEvent>,
    ) -> Result<Arc<dyn Operation>, Error> {
        let record = self.connected_record()?;
        let op = LoopbackOperation::new(
            kind,
            self.me.clone(),
            record,
            request.clone(),
            Arc::clone(&self.shared),
            self.dispatcher.clone(),
            events,
        );
        {
            let mut inner = self.inner.lock();
            inner.operations.retain(|w| w.strong_count() > 0);
            inner.operations.push(Arc::downgrade(&op));
        }

        let event = op.negotiate();
        let sink = Arc::clone(&op.events);
        self.dispatcher.post(move || sink(event));
        Ok(op)
    }

    fn create_monitor(
        &self,
        request: &PvRequest,
        events: Callback<MonitorEvent>,
    ) -> Result<Arc<dyn Monitor>, Error> {
        let record = self.connected_record()?;
        let (status, shape) = match record.select(request.field_selection()) {
            Ok(shape) => (Status::ok(), Some(shape)),
            Err(e) => (Status::error(e.to_string()), None),
        };
        let monitor = LoopbackMonitor::new(
            record,
            request.field_selection().clone(),
            shape.clone().unwrap_or_default(),
            request.queue_size(),
            Arc::clone(&self.shared),
            self.dispatcher.clone(),
            Arc::clone(&events),
        );
        {
            let mut inner = self.inner.lock();
            inner.monitors.retain(|w| w.strong_count() > 0);
            inner.monitors.push(Arc::downgrade(&monitor));
        }
        self.dispatcher
            .post(move || events(MonitorEvent::Connected { status, shape }));
        Ok(monitor)
    }

    fn destroy(&self) {
        let (record, operations, monitors) = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            (
                inner.record.take(),
                std::mem::take(&mut inner.operations),
                std::mem::take(&mut inner.monitors),
            )
        };
        if let Some(record) = record {
            record.detach_channel(self);
        }
        for op in operations.iter().filter_map(Weak::upgrade) {
            op.destroy();
        }
        for monitor in monitors.iter().filter_map(Weak::upgrade) {
            monitor.destroy();
        }
        let on_state = Arc::clone(&self.on_state);
        self.dispatcher
            .post(move || on_state(ConnectionState::Destroyed));
        debug!(channel = %self.name, "loopback channel destroyed");
    }
}

// ── One-shot operations ──────────────────────────────────────────

pub(crate) struct LoopbackOperation {
    me: Weak<LoopbackOperation>,
    kind: OperationKind,
    channel: Weak<LoopbackChannel>,
    record: Arc<Record>,
    request: PvRequest,
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    events: Callback<OperationEvent>,
    destroyed: AtomicBool,
}

impl LoopbackOperation {
    fn new(
        kind: OperationKind,
        channel: Weak<LoopbackChannel>,
        record: Arc<Record>,
        request: PvRequest,
        shared: Arc<Shared>,
        dispatcher: Dispatcher,
        events: Callback<OperationEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            kind,
            channel,
            record,
            request,
            shared,
            dispatcher,
            events,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Resolve the request against the record shape.
    fn negotiate(&self) -> OperationEvent {
        let put = || self.record.select(self.request.put_selection());
        let get = || self.record.select(self.request.get_selection());
        let shapes = match self.kind {
            OperationKind::Get => get().map(|g| (None, Some(g))),
            OperationKind::Put => put().map(|p| (Some(p), None)),
            OperationKind::PutGet => put().and_then(|p| get().map(|g| (Some(p), Some(g)))),
            OperationKind::Process => Ok((None, None)),
            OperationKind::Rpc => match self.record.rpc_handler() {
                Some(_) => Ok((None, None)),
                None => Err(Error::Unsupported(format!(
                    "record '{}' does not serve rpc",
                    self.record.name()
                ))),
            },
        };
        match shapes {
            Ok((put_shape, get_shape)) => OperationEvent::Connected {
                status: Status::ok(),
                put_shape,
                get_shape,
            },
            Err(e) => OperationEvent::Connected {
                status: Status::error(e.to_string()),
                put_shape: None,
                get_shape: None,
            },
        }
    }

    fn perform(&self, action: Action) -> OperationEvent {
        if !self.channel.upgrade().is_some_and(|c| c.is_connected()) {
            return completed(Status::error("channel disconnected"), None);
        }
        let process = self.request.wants_process();
        match (self.kind, action) {
            (OperationKind::Get, Action::Get) | (OperationKind::PutGet, Action::GetGet) => {
                self.read(self.request.get_selection())
            }
            (OperationKind::Put, Action::Get) | (OperationKind::PutGet, Action::GetPut) => {
                self.read(self.request.put_selection())
            }
            (OperationKind::Put, Action::Put { value, changed }) => {
                completed(self.record.write(&value, &changed, process), None)
            }
            (OperationKind::PutGet, Action::PutGet { value, changed }) => {
                let status = self.record.write(&value, &changed, process);
                if status.is_ok() {
                    self.read(self.request.get_selection())
                } else {
                    completed(status, None)
                }
            }
            (OperationKind::Process, Action::Process) => completed(self.record.process(), None),
            (OperationKind::Rpc, Action::Rpc { arguments }) => {
                let Some(handler) = self.record.rpc_handler() else {
                    return completed(Status::error("rpc not supported"), None);
                };
                match handler(&arguments) {
                    Ok(result) => completed(Status::ok(), Some(result)),
                    Err(status) => completed(status, None),
                }
            }
            (kind, action) => {
                warn!(%kind, action = action.name(), "action not valid for request kind");
                completed(
                    Status::error(format!("{} is not valid on a {kind} request", action.name())),
                    None,
                )
            }
        }
    }

    fn read(&self, selection: &crate::request::FieldSelection) -> OperationEvent {
        match self.record.select(selection) {
            Ok(value) => completed(Status::ok(), Some(value)),
            Err(e) => completed(Status::error(e.to_string()), None),
        }
    }
}

fn completed(status: Status, value: Option<PvStructure>) -> OperationEvent {
    let changed = if value.is_some() {
        BitSet::whole()
    } else {
        BitSet::new()
    };
    OperationEvent::Completed {
        status,
        value,
        changed,
    }
}

impl Operation for LoopbackOperation {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn issue(&self, action: Action) {
        let me = self.me.clone();
        self.dispatcher.post(move || {
            let Some(op) = me.upgrade() else {
                return;
            };
            if op.destroyed.load(Ordering::Acquire) {
                return;
            }
            let event = op.perform(action);
            (op.events)(event);
        });
    }

    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.shared.note_released();
        }
    }
}
