// ── Generic request state machine ──
//
// One machine wraps one transport request object and turns its
// asynchronous connect and completion events into blocking issue/wait
// pairs. Every one-shot kind (get, put, put-get, process, rpc) is an
// instance of this machine; the kind-specific wrappers only decide which
// `Action` to issue and what to do with the completion payload.
//
// Events are applied under the machine's own lock and followed by a
// `notify_all`, so a waiter that checks state under the same lock can
// never miss a wakeup. No other lock is taken while this one is held.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use pvac_api::{
    Action, BitSet, Callback, Operation, OperationEvent, OperationKind, PvRequest, PvStructure,
    Status,
};
use tracing::{debug, trace, warn};

use crate::channel::{ChannelInner, ClientChannel};
use crate::config::{ClientConfig, wait_limit};
use crate::error::CoreError;

/// Called after every completion, outside the machine lock.
pub(crate) type CompletionListener = Arc<dyn Fn(&Status) + Send + Sync>;

/// Connection sub-state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectPhase {
    Idle,
    Connecting,
    Connected,
}

/// Operation sub-state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum OperationPhase {
    Idle,
    Active,
    Complete,
}

/// Payload of one finished exchange.
#[derive(Debug, Clone)]
pub(crate) struct Completion {
    pub status: Status,
    /// `false` when the wait timed out with the exchange still active.
    pub finished: bool,
    pub value: Option<PvStructure>,
    pub changed: BitSet,
}

type Shapes = (Option<PvStructure>, Option<PvStructure>);

struct State {
    connect: ConnectPhase,
    op: OperationPhase,
    connect_status: Status,
    op_status: Status,
    destroyed: bool,
    /// Bumped per connect attempt; events from older attempts are dropped.
    attempt: u64,
    handle: Option<Arc<dyn Operation>>,
    /// Connect event that arrived before the handle was stored.
    early_connect: Option<(Status, Shapes)>,
    put_shape: Option<PvStructure>,
    get_shape: Option<PvStructure>,
    completion: Option<(Option<PvStructure>, BitSet)>,
}

pub(crate) struct RequestMachine {
    me: Weak<RequestMachine>,
    kind: OperationKind,
    channel: Weak<ChannelInner>,
    channel_name: String,
    request: PvRequest,
    config: Arc<ClientConfig>,
    listener: Option<CompletionListener>,
    state: Mutex<State>,
    cond: Condvar,
}

impl RequestMachine {
    pub(crate) fn new(
        channel: &ClientChannel,
        kind: OperationKind,
        request: PvRequest,
        listener: Option<CompletionListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            kind,
            channel: channel.downgrade(),
            channel_name: channel.name().to_owned(),
            request,
            config: channel.config(),
            listener,
            state: Mutex::new(State {
                connect: ConnectPhase::Idle,
                op: OperationPhase::Idle,
                connect_status: Status::error("connect not issued"),
                op_status: Status::ok(),
                destroyed: false,
                attempt: 0,
                handle: None,
                early_connect: None,
                put_shape: None,
                get_shape: None,
                completion: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub(crate) fn operation(&self) -> &'static str {
        self.kind.into()
    }

    pub(crate) fn request(&self) -> &PvRequest {
        &self.request
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    pub(crate) fn connect_phase(&self) -> ConnectPhase {
        self.state.lock().connect
    }

    pub(crate) fn operation_phase(&self) -> OperationPhase {
        self.state.lock().op
    }

    pub(crate) fn put_shape(&self) -> Option<PvStructure> {
        self.state.lock().put_shape.clone()
    }

    pub(crate) fn get_shape(&self) -> Option<PvStructure> {
        self.state.lock().get_shape.clone()
    }

    // ── Errors ───────────────────────────────────────────────────

    pub(crate) fn destroyed_error(&self) -> CoreError {
        CoreError::Destroyed {
            channel: self.channel_name.clone(),
            operation: self.operation().into(),
        }
    }

    pub(crate) fn failed(&self, status: Status) -> CoreError {
        CoreError::OperationFailed {
            channel: self.channel_name.clone(),
            operation: self.operation().into(),
            status,
        }
    }

    fn illegal(&self, reason: &str) -> CoreError {
        CoreError::IllegalState {
            channel: self.channel_name.clone(),
            operation: self.operation().into(),
            reason: reason.into(),
        }
    }

    fn live(&self) -> Result<MutexGuard<'_, State>, CoreError> {
        let state = self.state.lock();
        if state.destroyed {
            return Err(self.destroyed_error());
        }
        Ok(state)
    }

    // ── Connect ──────────────────────────────────────────────────

    /// Create the transport request object. Connects the channel first if
    /// it is not connected yet.
    pub(crate) fn issue_connect(&self) -> Result<(), CoreError> {
        if self.live()?.connect != ConnectPhase::Idle {
            return Err(self.illegal("connect already issued"));
        }
        let transport = self
            .channel
            .upgrade()
            .ok_or_else(|| CoreError::NotConnected {
                channel: self.channel_name.clone(),
            })?
            .ensure_connected()?;

        let attempt = {
            let mut state = self.live()?;
            if state.connect != ConnectPhase::Idle {
                return Err(self.illegal("connect already issued"));
            }
            state.connect = ConnectPhase::Connecting;
            state.attempt += 1;
            state.attempt
        };

        let me = self.me.clone();
        let events: Callback<OperationEvent> = Arc::new(move |event| {
            if let Some(machine) = me.upgrade() {
                machine.on_event(attempt, event);
            }
        });

        match transport.create_operation(self.kind, &self.request, events) {
            Ok(handle) => {
                let mut state = self.state.lock();
                if state.destroyed || state.attempt != attempt {
                    drop(state);
                    handle.destroy();
                    return Err(self.destroyed_error());
                }
                state.handle = Some(handle);
                let stale = state
                    .early_connect
                    .take()
                    .and_then(|(status, shapes)| self.apply_connect(&mut state, status, shapes));
                self.cond.notify_all();
                drop(state);
                if let Some(handle) = stale {
                    handle.destroy();
                }
                trace!(channel = %self.channel_name, operation = self.operation(), "connect issued");
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock();
                if state.attempt == attempt {
                    state.connect = ConnectPhase::Idle;
                    state.connect_status = Status::error(e.to_string());
                }
                self.cond.notify_all();
                Err(e.into())
            }
        }
    }

    /// Block until the connect attempt resolves or `timeout` passes.
    ///
    /// Returns the last connect status; a timeout is reported as an error
    /// status, not raised, and leaves the attempt outstanding.
    pub(crate) fn wait_connect(&self, timeout: Option<Duration>) -> Result<Status, CoreError> {
        let mut state = self.live()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        while state.connect == ConnectPhase::Connecting && !state.destroyed {
            if self.wait(&mut state, deadline) {
                break;
            }
        }
        if state.destroyed {
            return Err(self.destroyed_error());
        }
        Ok(match state.connect {
            ConnectPhase::Connecting => Status::timeout(
                &format!("{} {} connect", self.channel_name, self.operation()),
                timeout.unwrap_or_default().as_secs_f64(),
            ),
            ConnectPhase::Idle | ConnectPhase::Connected => state.connect_status.clone(),
        })
    }

    /// Connect if needed and wait, raising on failure.
    pub(crate) fn connect(&self) -> Result<(), CoreError> {
        if self.live()?.connect == ConnectPhase::Idle {
            self.issue_connect()?;
        }
        let status = self.wait_connect(wait_limit(self.config.connect_timeout))?;
        if self.connect_phase() == ConnectPhase::Connected && status.is_ok() {
            Ok(())
        } else {
            Err(CoreError::ConnectFailed {
                channel: self.channel_name.clone(),
                operation: self.operation().into(),
                status,
            })
        }
    }

    // ── Operation ────────────────────────────────────────────────

    /// Start one exchange. Connects first if the request never connected.
    pub(crate) fn issue(&self, action: Action) -> Result<(), CoreError> {
        if self.live()?.connect != ConnectPhase::Connected {
            self.connect()?;
        }
        let handle = {
            let mut state = self.live()?;
            if state.op != OperationPhase::Idle {
                return Err(CoreError::AlreadyActive {
                    channel: self.channel_name.clone(),
                    operation: self.operation().into(),
                });
            }
            let handle = state.handle.clone().ok_or_else(|| CoreError::NotConnected {
                channel: self.channel_name.clone(),
            })?;
            state.op = OperationPhase::Active;
            state.completion = None;
            handle
        };
        trace!(channel = %self.channel_name, action = action.name(), "issue");
        handle.issue(action);
        Ok(())
    }

    /// Block until the issued exchange completes or `timeout` passes.
    ///
    /// On timeout the exchange stays active; a later wait still observes
    /// the late completion.
    pub(crate) fn wait_completion(&self, timeout: Option<Duration>) -> Result<Completion, CoreError> {
        let mut state = self.live()?;
        if state.op == OperationPhase::Idle {
            return Err(CoreError::NotActive {
                channel: self.channel_name.clone(),
                operation: self.operation().into(),
            });
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        while state.op == OperationPhase::Active && !state.destroyed {
            if self.wait(&mut state, deadline) {
                break;
            }
        }
        if state.destroyed {
            return Err(self.destroyed_error());
        }
        if state.op == OperationPhase::Active {
            return Ok(Completion {
                status: Status::timeout(
                    &format!("{} {}", self.channel_name, self.operation()),
                    timeout.unwrap_or_default().as_secs_f64(),
                ),
                finished: false,
                value: None,
                changed: BitSet::new(),
            });
        }
        state.op = OperationPhase::Idle;
        let (value, changed) = state.completion.take().unwrap_or_default();
        Ok(Completion {
            status: state.op_status.clone(),
            finished: true,
            value,
            changed,
        })
    }

    /// Wait with the configured operation timeout.
    pub(crate) fn wait_default(&self) -> Result<Completion, CoreError> {
        self.wait_completion(wait_limit(self.config.operation_timeout))
    }

    /// Issue, wait, and raise on a failed status.
    pub(crate) fn execute(&self, action: Action) -> Result<Completion, CoreError> {
        self.issue(action)?;
        let completion = self.wait_default()?;
        if completion.status.is_ok() {
            Ok(completion)
        } else {
            Err(self.failed(completion.status))
        }
    }

    pub(crate) fn destroy(&self) {
        let handle = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.connect = ConnectPhase::Idle;
            state.op = OperationPhase::Idle;
            state.put_shape = None;
            state.get_shape = None;
            state.completion = None;
            state.handle.take()
        };
        self.cond.notify_all();
        if let Some(handle) = handle {
            handle.destroy();
        }
        debug!(channel = %self.channel_name, operation = self.operation(), "request destroyed");
    }

    // ── Transport events ─────────────────────────────────────────

    fn on_event(&self, attempt: u64, event: OperationEvent) {
        let mut stale = None;
        let mut finished = None;
        {
            let mut state = self.state.lock();
            if state.destroyed || state.attempt != attempt {
                return;
            }
            match event {
                OperationEvent::Connected {
                    status,
                    put_shape,
                    get_shape,
                } => {
                    if state.connect != ConnectPhase::Connecting {
                        return;
                    }
                    if state.handle.is_none() {
                        state.early_connect = Some((status, (put_shape, get_shape)));
                        return;
                    }
                    stale = self.apply_connect(&mut state, status, (put_shape, get_shape));
                }
                OperationEvent::Completed {
                    status,
                    value,
                    changed,
                } => {
                    if state.op != OperationPhase::Active {
                        warn!(
                            channel = %self.channel_name,
                            operation = self.operation(),
                            "completion without an active request dropped"
                        );
                        return;
                    }
                    state.op = OperationPhase::Complete;
                    state.op_status = status.clone();
                    state.completion = Some((value, changed));
                    finished = Some(status);
                }
            }
            self.cond.notify_all();
        }
        if let Some(handle) = stale {
            handle.destroy();
        }
        if let (Some(listener), Some(status)) = (&self.listener, finished) {
            listener(&status);
        }
    }

    /// Record the outcome of a connect; returns a handle to destroy if the
    /// connect failed.
    fn apply_connect(
        &self,
        state: &mut State,
        status: Status,
        (put_shape, get_shape): Shapes,
    ) -> Option<Arc<dyn Operation>> {
        let failed = !status.is_ok();
        state.connect_status = status;
        if failed {
            debug!(
                channel = %self.channel_name,
                operation = self.operation(),
                status = %state.connect_status,
                "request connect failed"
            );
            state.connect = ConnectPhase::Idle;
            return state.handle.take();
        }
        state.connect = ConnectPhase::Connected;
        state.put_shape = put_shape;
        state.get_shape = get_shape;
        debug!(channel = %self.channel_name, operation = self.operation(), "request connected");
        None
    }

    /// Wait on the condition; `true` once the deadline has passed.
    fn wait(&self, state: &mut MutexGuard<'_, State>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => self.cond.wait_until(state, deadline).timed_out(),
            None => {
                self.cond.wait(state);
                false
            }
        }
    }
}
