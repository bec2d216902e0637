use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use pvac_api::{PvRequest, PvStructure};
use tracing::debug;

use super::join::{Slot, join};
use super::{JoinMode, Members, MultiChannel};
use crate::config::wait_limit;
use crate::data::{MonitorData, ValueView};
use crate::error::CoreError;
use crate::monitor::{ClientMonitor, MonitorRequester};

const OPERATION: &str = "multiMonitor";

/// Wakes aggregate waiters whenever any member monitor has an event.
struct EventSignal {
    count: Mutex<u64>,
    cond: Condvar,
}

impl EventSignal {
    fn seen(&self) -> u64 {
        *self.count.lock()
    }

    /// Wait until the count moves past `seen`; `false` on timeout.
    fn wait_past(&self, seen: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count.lock();
        while *count == seen {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut count, deadline).timed_out() {
                        return *count != seen;
                    }
                }
                None => self.cond.wait(&mut count),
            }
        }
        true
    }

    fn wake(&self) {
        *self.count.lock() += 1;
        self.cond.notify_all();
    }
}

impl MonitorRequester for EventSignal {
    fn event(&self, _monitor: &ClientMonitor) {
        self.wake();
    }

    fn unlisten(&self, monitor: &ClientMonitor) {
        debug!(channel = monitor.channel_name(), "multi-monitor member unlistened");
        self.event(monitor);
    }
}

struct Aggregate {
    started: bool,
    client_owns: bool,
    claimed: Vec<bool>,
    /// Most recent element seen per channel.
    last: Vec<Option<MonitorData>>,
}

/// Monitors on every channel of a multi-channel set, polled as one.
///
/// `poll` claims every channel's available element at once;
/// `release` hands them all back and reports whether more are waiting.
pub struct MultiMonitor {
    multi: MultiChannel,
    request: PvRequest,
    mode: JoinMode,
    signal: Arc<EventSignal>,
    monitors: Members<ClientMonitor>,
    state: Mutex<Aggregate>,
}

impl MultiMonitor {
    pub(crate) fn new(multi: MultiChannel, request: PvRequest, mode: JoinMode) -> Self {
        let n = multi.len();
        Self {
            multi,
            request,
            mode,
            signal: Arc::new(EventSignal {
                count: Mutex::new(0),
                cond: Condvar::new(),
            }),
            monitors: Members::new(n),
            state: Mutex::new(Aggregate {
                started: false,
                client_owns: false,
                claimed: vec![false; n],
                last: vec![None; n],
            }),
        }
    }

    pub fn mode(&self) -> JoinMode {
        self.mode
    }

    /// Start a monitor on every connected channel. Channels that connect
    /// later are started by the next poll.
    pub fn start(&self) -> Result<(), CoreError> {
        self.live()?;
        self.state.lock().started = true;
        self.start_connected();
        Ok(())
    }

    pub fn stop(&self) -> Result<(), CoreError> {
        self.live()?;
        let claimed = {
            let mut state = self.state.lock();
            if !state.started {
                return Ok(());
            }
            state.started = false;
            state.client_owns = false;
            std::mem::replace(&mut state.claimed, vec![false; self.multi.len()])
        };
        let monitors = self.monitors.snapshot();
        for (index, monitor) in monitors.iter().enumerate() {
            let Some(monitor) = monitor else {
                continue;
            };
            if claimed[index] {
                monitor.release_event()?;
            }
            monitor.stop()?;
        }
        Ok(())
    }

    /// Claim every available element. Returns how many were claimed.
    pub fn poll(&self) -> Result<usize, CoreError> {
        self.live()?;
        {
            let state = self.state.lock();
            if !state.started {
                return Err(CoreError::NotStarted {
                    channel: self.label(),
                });
            }
            if state.client_owns {
                return Err(CoreError::DidNotRelease {
                    channel: self.label(),
                });
            }
        }
        self.start_connected();

        let monitors = self.monitors.snapshot();
        let mut claimed = vec![false; monitors.len()];
        let mut fresh = vec![None; monitors.len()];
        for (index, monitor) in monitors.iter().enumerate() {
            let Some(monitor) = monitor else {
                continue;
            };
            if !monitor.is_started() {
                continue;
            }
            let polled = monitor
                .poll()
                .and_then(|got| if got { monitor.data().map(Some) } else { Ok(None) });
            match polled {
                Ok(Some(data)) => {
                    claimed[index] = true;
                    fresh[index] = Some(data);
                }
                Ok(None) => {}
                Err(e) => debug!(index, error = %e, "multi-monitor member poll failed"),
            }
        }
        let count = claimed.iter().filter(|&&c| c).count();
        let mut state = self.state.lock();
        for (index, data) in fresh.into_iter().enumerate() {
            if data.is_some() {
                state.last[index] = data;
            }
        }
        if count > 0 {
            state.client_owns = true;
            state.claimed = claimed;
        }
        Ok(count)
    }

    /// Hand back every claimed element. `true` if more are already
    /// waiting.
    pub fn release(&self) -> Result<bool, CoreError> {
        self.live()?;
        let claimed = {
            let mut state = self.state.lock();
            if !state.client_owns {
                return Err(CoreError::NotPolled {
                    channel: self.label(),
                });
            }
            state.client_owns = false;
            std::mem::replace(&mut state.claimed, vec![false; self.multi.len()])
        };
        let monitors = self.monitors.snapshot();
        let mut more = false;
        for (index, monitor) in monitors.iter().enumerate() {
            let Some(monitor) = monitor else {
                continue;
            };
            if claimed[index] {
                monitor.release_event()?;
            }
            more |= monitor.pending() > 0;
        }
        Ok(more)
    }

    /// Poll, and if nothing was claimed wait up to `timeout` for an event
    /// and poll again. Zero waits forever.
    pub fn wait_event(&self, timeout: Duration) -> Result<usize, CoreError> {
        self.live()?;
        let seen = self.signal.seen();
        let count = self.poll()?;
        if count > 0 {
            return Ok(count);
        }
        if !self.signal.wait_past(seen, wait_limit(timeout)) {
            return Ok(0);
        }
        self.poll()
    }

    /// Latest value per channel as doubles; NaN where none arrived yet.
    pub fn double_array(&self) -> Vec<f64> {
        self.state
            .lock()
            .last
            .iter()
            .map(|data| {
                data.as_ref()
                    .and_then(|d| d.get_double().ok())
                    .unwrap_or(f64::NAN)
            })
            .collect()
    }

    /// The NTMultiChannel view of the latest values.
    pub fn joined_structure(&self) -> Result<PvStructure, CoreError> {
        if self.mode != JoinMode::NtMultiChannel {
            return Err(CoreError::IllegalState {
                channel: self.label(),
                operation: OPERATION.into(),
                reason: "joined structure needs NtMultiChannel mode".into(),
            });
        }
        let names = self.multi.channel_names();
        let connected = self.multi.is_connected();
        let state = self.state.lock();
        let slots: Vec<Slot<'_>> = names
            .iter()
            .zip(connected)
            .zip(state.last.iter())
            .map(|((name, connected), data)| Slot {
                name,
                connected,
                value: data.as_ref().and_then(|d| d.structure()),
            })
            .collect();
        Ok(join(&slots))
    }

    /// Latest element of channel `index`.
    pub fn data(&self, index: usize) -> Option<MonitorData> {
        self.state.lock().last.get(index).cloned().flatten()
    }

    /// Destroy every member monitor. Every later operation fails.
    /// Idempotent.
    pub fn destroy(&self) {
        if !self.monitors.destroy() {
            return;
        }
        {
            let mut state = self.state.lock();
            state.started = false;
            state.client_owns = false;
        }
        self.signal.wake();
        debug!(channels = self.multi.len(), "multi-monitor destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.monitors.is_destroyed()
    }

    /// Start members for channels that are connected but not yet started.
    fn start_connected(&self) {
        for (index, connected) in self.multi.is_connected().into_iter().enumerate() {
            if !connected {
                continue;
            }
            if let Err(e) = self.monitor_for(index).and_then(|m| m.start()) {
                debug!(index, error = %e, "multi-monitor member not started");
            }
        }
    }

    fn monitor_for(&self, index: usize) -> Result<Arc<ClientMonitor>, CoreError> {
        if let Some(monitor) = self.monitors.get(index) {
            return Ok(monitor);
        }
        let channel = &self.multi.channels()[index];
        let monitor = ClientMonitor::new(channel, self.request.clone());
        monitor.set_requester(Arc::clone(&self.signal) as Arc<dyn MonitorRequester>);
        self.monitors
            .store(index, monitor)
            .ok_or_else(|| self.destroyed_error())
    }

    fn live(&self) -> Result<(), CoreError> {
        if self.monitors.is_destroyed() {
            return Err(self.destroyed_error());
        }
        if self.multi.is_destroyed() {
            return Err(self.multi.destroyed_error());
        }
        Ok(())
    }

    fn destroyed_error(&self) -> CoreError {
        CoreError::Destroyed {
            channel: self.label(),
            operation: OPERATION.into(),
        }
    }

    fn label(&self) -> String {
        format!("{} channels", self.multi.len())
    }
}
