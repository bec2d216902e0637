// ── Monitor state machine ──
//
// Subscription lifecycle (connect, start, stop) plus the poll/release
// ownership protocol over the transport's element queue. Between a
// successful `poll` and the matching `release_event` the client owns one
// element and may read it through `data()`; at any other time the data
// accessors are refused.
//
// Each subscription carries a generation number. Restarting with a new
// request bumps it, and events tagged with an older generation are
// dropped, so nothing from the previous subscription leaks into the new
// one.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use pvac_api::{
    Callback, Monitor, MonitorElement, MonitorEvent, PvRequest, PvStructure, Status,
};
use tracing::{debug, trace, warn};

use crate::channel::{ChannelInner, ClientChannel};
use crate::config::{ClientConfig, wait_limit};
use crate::data::MonitorData;
use crate::error::CoreError;
use crate::request::ConnectPhase;

/// Receives asynchronous notifications from a [`ClientMonitor`].
///
/// Called on transport threads with no monitor lock held, so it may call
/// back into the monitor.
pub trait MonitorRequester: Send + Sync {
    /// At least one element is ready to poll.
    fn event(&self, monitor: &ClientMonitor);

    /// The server ended the subscription.
    fn unlisten(&self, monitor: &ClientMonitor) {
        warn!(channel = monitor.channel_name(), "monitor unlisten");
    }
}

struct MonitorState {
    request: PvRequest,
    connect: ConnectPhase,
    connect_status: Status,
    started: bool,
    client_owns: bool,
    /// A poll is consulting the transport queue.
    polling: bool,
    unlistened: bool,
    destroyed: bool,
    /// Bumped per subscription; stale events are dropped.
    generation: u64,
    /// Bumped per `Event`; lets `wait_event` detect arrivals it raced with.
    events: u64,
    handle: Option<Arc<dyn Monitor>>,
    early_connect: Option<(Status, Option<PvStructure>)>,
    data: MonitorData,
    element: Option<MonitorElement>,
    requester: Option<Arc<dyn MonitorRequester>>,
}

/// A subscription to one channel.
pub struct ClientMonitor {
    me: Weak<ClientMonitor>,
    channel: Weak<ChannelInner>,
    channel_name: String,
    config: Arc<ClientConfig>,
    state: Mutex<MonitorState>,
    cond: Condvar,
}

impl ClientMonitor {
    pub(crate) fn new(channel: &ClientChannel, request: PvRequest) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            channel: channel.downgrade(),
            channel_name: channel.name().to_owned(),
            config: channel.config(),
            state: Mutex::new(MonitorState {
                request,
                connect: ConnectPhase::Idle,
                connect_status: Status::error("connect not issued"),
                started: false,
                client_owns: false,
                polling: false,
                unlistened: false,
                destroyed: false,
                generation: 0,
                events: 0,
                handle: None,
                early_connect: None,
                data: MonitorData::new(channel.name(), None),
                element: None,
                requester: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Text of the current request.
    pub fn request(&self) -> String {
        self.state.lock().request.as_str().to_owned()
    }

    pub fn connect_phase(&self) -> ConnectPhase {
        self.state.lock().connect
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// `true` once the server ended the subscription.
    pub fn is_unlistened(&self) -> bool {
        self.state.lock().unlistened
    }

    pub fn set_requester(&self, requester: Arc<dyn MonitorRequester>) {
        self.state.lock().requester = Some(requester);
    }

    // ── Connect ──────────────────────────────────────────────────

    pub fn issue_connect(&self) -> Result<(), CoreError> {
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

        let (generation, request) = {
            let mut state = self.live()?;
            if state.connect != ConnectPhase::Idle {
                return Err(self.illegal("connect already issued"));
            }
            let request = self.sized_request(&state.request)?;
            state.connect = ConnectPhase::Connecting;
            state.generation += 1;
            (state.generation, request)
        };

        let me = self.me.clone();
        let events: Callback<MonitorEvent> = Arc::new(move |event| {
            if let Some(monitor) = me.upgrade() {
                monitor.on_event(generation, event);
            }
        });

        match transport.create_monitor(&request, events) {
            Ok(handle) => {
                let mut state = self.state.lock();
                if state.destroyed || state.generation != generation {
                    drop(state);
                    handle.destroy();
                    return Err(self.destroyed_error());
                }
                state.handle = Some(handle);
                let stale = state
                    .early_connect
                    .take()
                    .and_then(|(status, shape)| self.apply_connect(&mut state, status, shape));
                self.cond.notify_all();
                drop(state);
                if let Some(handle) = stale {
                    handle.destroy();
                }
                trace!(channel = %self.channel_name, request = request.as_str(), "monitor connect issued");
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock();
                if state.generation == generation {
                    state.connect = ConnectPhase::Idle;
                    state.connect_status = Status::error(e.to_string());
                }
                self.cond.notify_all();
                Err(e.into())
            }
        }
    }

    /// Zero waits forever. A timeout is returned as an error status.
    pub fn wait_connect(&self, timeout: Duration) -> Result<Status, CoreError> {
        let limit = wait_limit(timeout);
        let deadline = limit.map(|t| Instant::now() + t);
        let mut state = self.live()?;
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
                &format!("{} monitor connect", self.channel_name),
                timeout.as_secs_f64(),
            ),
            ConnectPhase::Idle | ConnectPhase::Connected => state.connect_status.clone(),
        })
    }

    pub fn connect(&self) -> Result<(), CoreError> {
        if self.live()?.connect == ConnectPhase::Idle {
            self.issue_connect()?;
        }
        let status = self.wait_connect(self.config.connect_timeout)?;
        if self.connect_phase() == ConnectPhase::Connected && status.is_ok() {
            Ok(())
        } else {
            Err(CoreError::ConnectFailed {
                channel: self.channel_name.clone(),
                operation: "monitor".into(),
                status,
            })
        }
    }

    // ── Subscription ─────────────────────────────────────────────

    /// Begin delivering elements. Connects first if needed; a no-op if
    /// already started.
    pub fn start(&self) -> Result<(), CoreError> {
        {
            let state = self.live()?;
            if state.started {
                return Ok(());
            }
            if state.connect != ConnectPhase::Connected {
                drop(state);
                self.connect()?;
            }
        }
        let handle = {
            let mut state = self.live()?;
            if state.started {
                return Ok(());
            }
            let handle = self.handle(&state)?;
            state.started = true;
            state.unlistened = false;
            handle
        };
        let status = handle.start();
        if !status.is_ok() {
            self.state.lock().started = false;
            return Err(self.failed("start", status));
        }
        debug!(channel = %self.channel_name, "monitor started");
        Ok(())
    }

    /// Tear down the current subscription and start a new one for
    /// `request`.
    pub fn start_with(&self, request: &str) -> Result<(), CoreError> {
        let request = PvRequest::parse(request)?;
        let (handle, element) = {
            let mut state = self.live()?;
            state.generation += 1;
            state.request = request;
            state.connect = ConnectPhase::Idle;
            state.connect_status = Status::error("connect not issued");
            state.started = false;
            state.client_owns = false;
            state.unlistened = false;
            state.early_connect = None;
            state.data = MonitorData::new(&self.channel_name, None);
            (state.handle.take(), state.element.take())
        };
        self.cond.notify_all();
        if let Some(handle) = handle {
            if let Some(element) = element {
                handle.release(element);
            }
            handle.stop();
            handle.destroy();
        }
        self.connect()?;
        self.start()
    }

    /// Stop delivering elements. A no-op if not started.
    pub fn stop(&self) -> Result<(), CoreError> {
        let (handle, element) = {
            let mut state = self.live()?;
            if !state.started {
                return Ok(());
            }
            state.started = false;
            state.client_owns = false;
            (self.handle(&state)?, state.element.take())
        };
        if let Some(element) = element {
            handle.release(element);
        }
        let status = handle.stop();
        self.cond.notify_all();
        if status.is_ok() {
            debug!(channel = %self.channel_name, "monitor stopped");
            Ok(())
        } else {
            Err(self.failed("stop", status))
        }
    }

    // ── Element ownership ────────────────────────────────────────

    /// Take the oldest queued element. `false` if the queue is empty.
    pub fn poll(&self) -> Result<bool, CoreError> {
        let (handle, generation) = {
            let mut state = self.live()?;
            if !state.started {
                return Err(CoreError::NotStarted {
                    channel: self.channel_name.clone(),
                });
            }
            if state.client_owns || state.polling {
                return Err(CoreError::DidNotRelease {
                    channel: self.channel_name.clone(),
                });
            }
            let handle = self.handle(&state)?;
            state.polling = true;
            (handle, state.generation)
        };
        let element = handle.poll();
        let mut state = self.state.lock();
        state.polling = false;
        match element {
            Some(element)
                if !state.destroyed && state.started && state.generation == generation =>
            {
                state.data.update(&element);
                state.element = Some(element);
                state.client_owns = true;
                Ok(true)
            }
            Some(element) => {
                drop(state);
                handle.release(element);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Poll, and if nothing is queued wait up to `timeout` for an event
    /// and poll again. Zero waits forever.
    pub fn wait_event(&self, timeout: Duration) -> Result<bool, CoreError> {
        let seen = self.live()?.events;
        if self.poll()? {
            return Ok(true);
        }
        let deadline = wait_limit(timeout).map(|t| Instant::now() + t);
        {
            let mut state = self.live()?;
            while state.events == seen && state.started && !state.unlistened && !state.destroyed {
                if self.wait(&mut state, deadline) {
                    break;
                }
            }
            if state.destroyed {
                return Err(self.destroyed_error());
            }
            if !state.started {
                return Ok(false);
            }
        }
        self.poll()
    }

    /// Hand the polled element back to the subscription.
    pub fn release_event(&self) -> Result<(), CoreError> {
        let (handle, element) = {
            let mut state = self.live()?;
            if !state.client_owns {
                return Err(CoreError::NotPolled {
                    channel: self.channel_name.clone(),
                });
            }
            state.client_owns = false;
            (state.handle.clone(), state.element.take())
        };
        if let (Some(handle), Some(element)) = (handle, element) {
            handle.release(element);
        }
        Ok(())
    }

    /// The element currently owned by the client.
    pub fn data(&self) -> Result<MonitorData, CoreError> {
        let state = self.live()?;
        if !state.client_owns {
            return Err(self.illegal("no element polled"));
        }
        Ok(state.data.clone())
    }

    /// Elements queued and not yet polled.
    pub fn pending(&self) -> usize {
        let handle = self.state.lock().handle.clone();
        handle.map_or(0, |handle| handle.pending())
    }

    /// Idempotent.
    pub fn destroy(&self) {
        let (handle, element) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.started = false;
            state.client_owns = false;
            state.connect = ConnectPhase::Idle;
            state.requester = None;
            (state.handle.take(), state.element.take())
        };
        self.cond.notify_all();
        if let Some(handle) = handle {
            if let Some(element) = element {
                handle.release(element);
            }
            handle.destroy();
        }
        debug!(channel = %self.channel_name, "monitor destroyed");
    }

    // ── Transport events ─────────────────────────────────────────

    fn on_event(&self, generation: u64, event: MonitorEvent) {
        let mut stale = None;
        let requester;
        let mut unlisten = false;
        {
            let mut state = self.state.lock();
            if state.destroyed || state.generation != generation {
                return;
            }
            match event {
                MonitorEvent::Connected { status, shape } => {
                    if state.connect != ConnectPhase::Connecting {
                        return;
                    }
                    if state.handle.is_none() {
                        state.early_connect = Some((status, shape));
                        return;
                    }
                    stale = self.apply_connect(&mut state, status, shape);
                    requester = None;
                }
                MonitorEvent::Event => {
                    state.events += 1;
                    requester = state.requester.clone();
                }
                MonitorEvent::Unlisten => {
                    state.unlistened = true;
                    unlisten = true;
                    requester = state.requester.clone();
                }
            }
            self.cond.notify_all();
        }
        if let Some(handle) = stale {
            handle.destroy();
        }
        match (requester, unlisten) {
            (Some(requester), false) => requester.event(self),
            (Some(requester), true) => requester.unlisten(self),
            (None, true) => warn!(channel = %self.channel_name, "monitor unlisten"),
            (None, false) => {}
        }
    }

    fn apply_connect(
        &self,
        state: &mut MonitorState,
        status: Status,
        shape: Option<PvStructure>,
    ) -> Option<Arc<dyn Monitor>> {
        let failed = !status.is_ok();
        state.connect_status = status;
        if failed {
            debug!(channel = %self.channel_name, status = %state.connect_status, "monitor connect failed");
            state.connect = ConnectPhase::Idle;
            return state.handle.take();
        }
        state.connect = ConnectPhase::Connected;
        state.data = MonitorData::new(&self.channel_name, shape);
        debug!(channel = %self.channel_name, "monitor connected");
        None
    }

    // ── Helpers ──────────────────────────────────────────────────

    /// Apply the configured queue size unless the request names one.
    fn sized_request(&self, request: &PvRequest) -> Result<PvRequest, CoreError> {
        match self.config.monitor_queue_size {
            Some(size) if request.queue_size().is_none() => {
                Ok(request.with_record_option("queueSize", &size.to_string())?)
            }
            _ => Ok(request.clone()),
        }
    }

    fn handle(&self, state: &MonitorState) -> Result<Arc<dyn Monitor>, CoreError> {
        state.handle.clone().ok_or_else(|| CoreError::NotConnected {
            channel: self.channel_name.clone(),
        })
    }

    fn live(&self) -> Result<MutexGuard<'_, MonitorState>, CoreError> {
        let state = self.state.lock();
        if state.destroyed {
            return Err(self.destroyed_error());
        }
        Ok(state)
    }

    fn destroyed_error(&self) -> CoreError {
        CoreError::Destroyed {
            channel: self.channel_name.clone(),
            operation: "monitor".into(),
        }
    }

    fn illegal(&self, reason: &str) -> CoreError {
        CoreError::IllegalState {
            channel: self.channel_name.clone(),
            operation: "monitor".into(),
            reason: reason.into(),
        }
    }

    fn failed(&self, operation: &str, status: Status) -> CoreError {
        CoreError::OperationFailed {
            channel: self.channel_name.clone(),
            operation: format!("monitor {operation}"),
            status,
        }
    }

    fn wait(&self, state: &mut MutexGuard<'_, MonitorState>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => self.cond.wait_until(state, deadline).timed_out(),
            None => {
                self.cond.wait(state);
                false
            }
        }
    }
}

impl std::fmt::Debug for ClientMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ClientMonitor")
            .field("channel", &self.channel_name)
            .field("request", &state.request.as_str())
            .field("connect", &state.connect)
            .field("started", &state.started)
            .field("client_owns", &state.client_owns)
            .field("polling", &state.polling)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::mpsc::{Receiver, Sender, channel};

    use pvac_api::{
        BitSet, Channel, ChannelProvider, ConnectionState, Error, Operation, OperationEvent,
        OperationKind,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    /// Transport whose monitor poll blocks until the test opens the gate.
    struct Gated {
        entered: Mutex<Sender<()>>,
        gate: Mutex<Receiver<()>>,
    }

    struct GatedProvider(Arc<Gated>);
    struct GatedChannel(Arc<Gated>);
    struct GatedMonitor(Arc<Gated>);

    fn value() -> PvStructure {
        PvStructure::default().with_field("value", 1.0)
    }

    impl ChannelProvider for GatedProvider {
        fn name(&self) -> &str {
            "gated"
        }

        fn create_channel(
            &self,
            _name: &str,
            on_state: Callback<ConnectionState>,
        ) -> Result<Arc<dyn Channel>, Error> {
            on_state(ConnectionState::Connected);
            Ok(Arc::new(GatedChannel(Arc::clone(&self.0))))
        }
    }

    impl Channel for GatedChannel {
        fn name(&self) -> &str {
            "pv"
        }

        fn provider_name(&self) -> &str {
            "gated"
        }

        fn connection_state(&self) -> ConnectionState {
            ConnectionState::Connected
        }

        fn create_operation(
            &self,
            _kind: OperationKind,
            _request: &PvRequest,
            _events: Callback<OperationEvent>,
        ) -> Result<Arc<dyn Operation>, Error> {
            Err(Error::Unsupported("operations".into()))
        }

        fn create_monitor(
            &self,
            _request: &PvRequest,
            events: Callback<MonitorEvent>,
        ) -> Result<Arc<dyn Monitor>, Error> {
            events(MonitorEvent::Connected {
                status: Status::ok(),
                shape: Some(value()),
            });
            Ok(Arc::new(GatedMonitor(Arc::clone(&self.0))))
        }

        fn destroy(&self) {}
    }

    impl Monitor for GatedMonitor {
        fn start(&self) -> Status {
            Status::ok()
        }

        fn stop(&self) -> Status {
            Status::ok()
        }

        fn poll(&self) -> Option<MonitorElement> {
            self.0.entered.lock().send(()).unwrap();
            self.0.gate.lock().recv_timeout(WAIT).ok()?;
            Some(MonitorElement {
                value: value(),
                changed: BitSet::whole(),
                overrun: BitSet::new(),
            })
        }

        fn release(&self, _element: MonitorElement) {}

        fn pending(&self) -> usize {
            0
        }

        fn destroy(&self) {}
    }

    #[test]
    fn release_during_poll_does_not_orphan_the_element() {
        let (entered_tx, entered_rx) = channel();
        let (gate_tx, gate_rx) = channel();
        let gated = Arc::new(Gated {
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
        });
        let channel = ClientChannel::new(
            "pv",
            Arc::new(GatedProvider(gated)),
            Arc::new(ClientConfig::default()),
        );
        let monitor = ClientMonitor::new(&channel, PvRequest::parse("field(value)").unwrap());
        monitor.start().unwrap();

        let poller = {
            let monitor = Arc::clone(&monitor);
            std::thread::spawn(move || monitor.poll())
        };
        entered_rx.recv_timeout(WAIT).unwrap();

        // Nothing is owned yet, and the poll in flight blocks a second one.
        assert!(matches!(
            monitor.release_event(),
            Err(CoreError::NotPolled { .. })
        ));
        assert!(matches!(
            monitor.poll(),
            Err(CoreError::DidNotRelease { .. })
        ));
        assert!(monitor.data().is_err());

        gate_tx.send(()).unwrap();
        assert!(poller.join().unwrap().unwrap());
        assert!(monitor.data().is_ok());
        monitor.release_event().unwrap();
        assert!(matches!(
            monitor.release_event(),
            Err(CoreError::NotPolled { .. })
        ));
    }
}
