// ── Multi-channel aggregation ──
//
// A fixed, index-addressed set of channels on one provider, connected as
// a unit with a partial-success policy, plus the get / put / monitor
// aggregates built on top of it.
//
// Per-channel connection callbacks feed one shared counter under the
// set's own lock. The aggregates count per-channel completions the same
// way through a `Fanout`.

mod get;
mod join;
mod monitor;
mod put;

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use pvac_api::{Callback, ConnectionState, PvRequest, Status};
use tracing::{debug, info};

pub use self::get::MultiGet;
pub use self::monitor::MultiMonitor;
pub use self::put::MultiPut;
use crate::cache::Destroy;
use crate::channel::ClientChannel;
use crate::config::{ClientConfig, wait_limit};
use crate::error::CoreError;

/// How an aggregate presents the joined channel values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum JoinMode {
    /// A plain `f64` array aligned by channel index; absent values are NaN.
    #[default]
    Double,
    /// An NTMultiChannel structure with a union array of values.
    NtMultiChannel,
}

// ── MultiChannel ─────────────────────────────────────────────────

/// An ordered set of channels sharing one provider.
///
/// Cheaply cloneable. Indices are fixed at construction and stay valid
/// for the lifetime of the set.
#[derive(Clone)]
pub struct MultiChannel {
    inner: Arc<MultiInner>,
}

struct MultiInner {
    provider: String,
    config: Arc<ClientConfig>,
    channels: Vec<ClientChannel>,
    state: Mutex<MultiState>,
    cond: Condvar,
}

struct MultiState {
    requested: Vec<bool>,
    connected: Vec<bool>,
    connected_count: usize,
    connect_pending: bool,
    listening: bool,
    destroyed: bool,
}

impl MultiChannel {
    pub(crate) fn new(provider: &str, config: Arc<ClientConfig>, channels: Vec<ClientChannel>) -> Self {
        let n = channels.len();
        Self {
            inner: Arc::new(MultiInner {
                provider: provider.to_owned(),
                config,
                channels,
                state: Mutex::new(MultiState {
                    requested: vec![false; n],
                    connected: vec![false; n],
                    connected_count: 0,
                    connect_pending: false,
                    listening: false,
                    destroyed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.channels.is_empty()
    }

    pub fn provider_name(&self) -> &str {
        &self.inner.provider
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.inner.channels.iter().map(|c| c.name().to_owned()).collect()
    }

    pub fn channels(&self) -> &[ClientChannel] {
        &self.inner.channels
    }

    pub fn channel(&self, index: usize) -> Option<&ClientChannel> {
        self.inner.channels.get(index)
    }

    pub(crate) fn config(&self) -> &Arc<ClientConfig> {
        &self.inner.config
    }

    // ── Connection ───────────────────────────────────────────────

    /// Start connecting every channel not yet asked to connect.
    ///
    /// Fails if a previous connect has not been waited for.
    pub fn issue_connect(&self) -> Result<(), CoreError> {
        let register = {
            let mut state = self.live()?;
            if state.connect_pending {
                return Err(CoreError::ConnectAlreadyIssued);
            }
            state.connect_pending = true;
            !std::mem::replace(&mut state.listening, true)
        };

        if register {
            for (index, channel) in self.inner.channels.iter().enumerate() {
                let me = Arc::downgrade(&self.inner);
                let listener: Callback<ConnectionState> = Arc::new(move |next| {
                    if let Some(inner) = me.upgrade() {
                        inner.on_state(index, next == ConnectionState::Connected);
                    }
                });
                channel.add_state_listener(listener);
            }
        }

        let to_request: Vec<usize> = {
            let mut state = self.inner.state.lock();
            let pending: Vec<usize> = (0..state.requested.len())
                .filter(|&i| !state.requested[i])
                .collect();
            for &i in &pending {
                state.requested[i] = true;
            }
            pending
        };
        for index in to_request {
            let channel = &self.inner.channels[index];
            if let Err(e) = channel.request_connect() {
                debug!(channel = channel.name(), error = %e, "channel connect not issued");
            }
        }

        // Channels shared with earlier users may already be up.
        for (index, channel) in self.inner.channels.iter().enumerate() {
            if channel.is_connected() {
                self.inner.on_state(index, true);
            }
        }
        Ok(())
    }

    /// Wait for channels to connect.
    ///
    /// Each round waits up to `timeout` for the connected count to grow.
    /// The loop ends when every channel is connected, when a round adds
    /// nothing, or once `min_connect` channels are up. Fails if fewer than
    /// `min_connect` channels are connected at the end.
    pub fn wait_connect(&self, timeout: Duration, min_connect: usize) -> Result<usize, CoreError> {
        let n = self.len();
        let limit = wait_limit(timeout);
        let mut state = self.live()?;
        let mut last = state.connected_count;
        while state.connected_count < n {
            let before = state.connected_count;
            let deadline = limit.map(|t| Instant::now() + t);
            while state.connected_count == before && !state.destroyed {
                if self.inner.wait(&mut state, deadline) {
                    break;
                }
            }
            if state.destroyed {
                return Err(self.destroyed_error());
            }
            let now = state.connected_count;
            if now == n || now <= last || now >= min_connect {
                break;
            }
            last = now;
        }
        state.connect_pending = false;
        let connected = state.connected_count;
        drop(state);

        if connected < min_connect {
            info!(provider = %self.inner.provider, connected, required = min_connect, "multi-channel connect fell short");
            return Err(CoreError::ConnectCount {
                connected,
                required: min_connect,
            });
        }
        info!(provider = %self.inner.provider, connected, total = n, "multi-channel connect done");
        Ok(connected)
    }

    /// Connect with the configured timeout and minimum.
    pub fn connect(&self) -> Result<usize, CoreError> {
        let config = &self.inner.config;
        let min_connect = config.min_connect.unwrap_or(self.len());
        self.connect_with(config.multi_connect_timeout, min_connect)
    }

    pub fn connect_with(&self, timeout: Duration, min_connect: usize) -> Result<usize, CoreError> {
        self.issue_connect()?;
        self.wait_connect(timeout, min_connect)
    }

    pub fn all_connected(&self) -> bool {
        let state = self.inner.state.lock();
        state.connected_count == state.connected.len()
    }

    pub fn is_connected(&self) -> Vec<bool> {
        self.inner.state.lock().connected.clone()
    }

    pub fn connected_count(&self) -> usize {
        self.inner.state.lock().connected_count
    }

    // ── Aggregates ───────────────────────────────────────────────

    pub fn create_get(&self, request: &str, mode: JoinMode) -> Result<MultiGet, CoreError> {
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }
        Ok(MultiGet::new(self.clone(), PvRequest::parse(request)?, mode))
    }

    pub fn create_put(&self, request: &str, mode: JoinMode) -> Result<MultiPut, CoreError> {
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }
        Ok(MultiPut::new(self.clone(), PvRequest::parse(request)?, mode))
    }

    pub fn create_monitor(&self, request: &str, mode: JoinMode) -> Result<MultiMonitor, CoreError> {
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }
        Ok(MultiMonitor::new(self.clone(), PvRequest::parse(request)?, mode))
    }

    /// Mark the set destroyed. The channels themselves belong to the
    /// client context and stay alive.
    pub fn destroy(&self) {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        drop(state);
        self.inner.cond.notify_all();
        debug!(provider = %self.inner.provider, "multi-channel destroyed");
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    pub(crate) fn destroyed_error(&self) -> CoreError {
        CoreError::Destroyed {
            channel: format!("{} channels", self.len()),
            operation: "multiChannel".into(),
        }
    }

    fn live(&self) -> Result<MutexGuard<'_, MultiState>, CoreError> {
        let state = self.inner.state.lock();
        if state.destroyed {
            return Err(self.destroyed_error());
        }
        Ok(state)
    }
}

impl std::fmt::Debug for MultiChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiChannel")
            .field("provider", &self.inner.provider)
            .field("channels", &self.channel_names())
            .field("connected", &self.connected_count())
            .finish()
    }
}

impl MultiInner {
    /// Idempotent per transition: a channel is counted at most once.
    fn on_state(&self, index: usize, connected: bool) {
        let mut state = self.state.lock();
        if state.destroyed || state.connected[index] == connected {
            return;
        }
        state.connected[index] = connected;
        if connected {
            state.connected_count += 1;
        } else {
            state.connected_count -= 1;
        }
        drop(state);
        self.cond.notify_all();
    }

    fn wait(&self, state: &mut MutexGuard<'_, MultiState>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => self.cond.wait_until(state, deadline).timed_out(),
            None => {
                self.cond.wait(state);
                false
            }
        }
    }
}

// ── Fanout ───────────────────────────────────────────────────────

/// Outcome of one aggregate exchange.
#[derive(Debug, Clone)]
pub(crate) struct FanoutResult {
    /// `false` if the wait timed out with completions outstanding.
    pub finished: bool,
    /// Ok, or the first failure as `(index, status)`.
    pub failure: Option<(usize, Status)>,
    /// Which indices took part.
    pub participants: Vec<bool>,
}

/// Completion counter shared by the per-channel requests of one
/// aggregate.
pub(crate) struct Fanout {
    state: Mutex<FanoutState>,
    cond: Condvar,
}

struct FanoutState {
    active: bool,
    participants: Vec<bool>,
    outstanding: Vec<bool>,
    remaining: usize,
    failure: Option<(usize, Status)>,
}

impl Fanout {
    pub(crate) fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FanoutState {
                active: false,
                participants: vec![false; n],
                outstanding: vec![false; n],
                remaining: 0,
                failure: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// Start counting completions from the marked indices.
    pub(crate) fn begin(&self, participants: &[bool]) -> bool {
        let mut state = self.state.lock();
        if state.active {
            return false;
        }
        state.active = true;
        state.participants = participants.to_vec();
        state.outstanding = participants.to_vec();
        state.remaining = participants.iter().filter(|&&p| p).count();
        state.failure = None;
        true
    }

    /// Stop awaiting an index whose request could not be issued.
    pub(crate) fn exclude(&self, index: usize) {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.outstanding[index]) {
            state.participants[index] = false;
            state.remaining -= 1;
        }
        drop(state);
        self.cond.notify_all();
    }

    pub(crate) fn complete(&self, index: usize, status: &Status) {
        let mut state = self.state.lock();
        if !state.active || !std::mem::take(&mut state.outstanding[index]) {
            return;
        }
        state.remaining -= 1;
        if !status.is_ok() && state.failure.is_none() {
            state.failure = Some((index, status.clone()));
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Record a failure that did not arrive through a completion.
    pub(crate) fn fail(&self, index: usize, status: Status) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some((index, status));
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Abandon the exchange in flight and wake its waiter.
    pub(crate) fn cancel(&self) {
        self.state.lock().active = false;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self, timeout: Option<Duration>) -> FanoutResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while state.active && state.remaining > 0 {
            let timed_out = match deadline {
                Some(deadline) => self.cond.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.cond.wait(&mut state);
                    false
                }
            };
            if timed_out {
                break;
            }
        }
        let finished = state.remaining == 0;
        if finished {
            state.active = false;
        }
        FanoutResult {
            finished,
            failure: state.failure.clone(),
            participants: state.participants.clone(),
        }
    }

    /// Listener that reports completions of request `index`.
    pub(crate) fn listener(self: &Arc<Self>, index: usize) -> Arc<dyn Fn(&Status) + Send + Sync> {
        let me: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |status: &Status| {
            if let Some(fanout) = me.upgrade() {
                fanout.complete(index, status);
            }
        })
    }
}

// ── Members ──────────────────────────────────────────────────────

/// The per-channel request objects of one aggregate, by index, and
/// whether the aggregate has been destroyed.
pub(crate) struct Members<T> {
    state: Mutex<MembersState<T>>,
}

struct MembersState<T> {
    items: Vec<Option<Arc<T>>>,
    destroyed: bool,
}

impl<T: Destroy> Members<T> {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            state: Mutex::new(MembersState {
                items: vec![None; n],
                destroyed: false,
            }),
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    pub(crate) fn get(&self, index: usize) -> Option<Arc<T>> {
        self.state.lock().items[index].clone()
    }

    pub(crate) fn snapshot(&self) -> Vec<Option<Arc<T>>> {
        self.state.lock().items.clone()
    }

    /// Keep a freshly created member for `index`.
    ///
    /// If another caller stored one first, `item` is destroyed and the
    /// stored member returned. `None` once the aggregate is destroyed, in
    /// which case `item` is destroyed too.
    pub(crate) fn store(&self, index: usize, item: Arc<T>) -> Option<Arc<T>> {
        let mut state = self.state.lock();
        if state.destroyed {
            drop(state);
            item.destroy();
            return None;
        }
        if let Some(existing) = state.items[index].clone() {
            drop(state);
            item.destroy();
            return Some(existing);
        }
        state.items[index] = Some(Arc::clone(&item));
        Some(item)
    }

    /// Mark destroyed and destroy every member. `false` if already
    /// destroyed.
    pub(crate) fn destroy(&self) -> bool {
        let items = {
            let mut state = self.state.lock();
            if std::mem::replace(&mut state.destroyed, true) {
                return false;
            }
            let n = state.items.len();
            std::mem::replace(&mut state.items, vec![None; n])
        };
        for item in items.into_iter().flatten() {
            item.destroy();
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn fanout_waits_for_participants_only() {
        let fanout = Fanout::new(3);
        assert!(fanout.begin(&[true, false, true]));
        assert!(!fanout.begin(&[true, true, true]));
        fanout.complete(0, &Status::ok());
        fanout.complete(1, &Status::error("not a participant"));
        let pending = fanout.wait(Some(Duration::from_millis(10)));
        assert!(!pending.finished);
        fanout.complete(2, &Status::ok());
        let done = fanout.wait(None);
        assert!(done.finished);
        assert!(done.failure.is_none());
        assert_eq!(done.participants, vec![true, false, true]);
        assert!(!fanout.is_active());
    }

    #[test]
    fn first_failure_wins() {
        let fanout = Fanout::new(3);
        fanout.begin(&[true, true, true]);
        fanout.complete(1, &Status::error("first"));
        fanout.complete(1, &Status::error("duplicate"));
        fanout.complete(0, &Status::error("second"));
        fanout.exclude(2);
        let done = fanout.wait(None);
        assert!(done.finished);
        assert_eq!(done.failure, Some((1, Status::error("first"))));
        assert_eq!(done.participants, vec![true, true, false]);
    }
}
