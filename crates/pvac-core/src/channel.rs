// ── Channel facade ──
//
// Owns one transport channel. Demultiplexes its connection-state
// callbacks into a blocking connect, fans them out to registered
// listeners, and caches one request object per distinct request text
// for every operation kind.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use pvac_api::{Callback, Channel, ChannelProvider, ConnectionState, PvRequest, Status};
use tracing::{debug, trace};

use crate::cache::{Destroy, RequestCache};
use crate::config::{ClientConfig, wait_limit};
use crate::data::ValueView;
use crate::error::CoreError;
use crate::monitor::ClientMonitor;
use crate::request::{ClientGet, ClientProcess, ClientPut, ClientPutGet, ClientRpc};

/// Request used by the convenience readers.
pub const DEFAULT_GET_REQUEST: &str = "field(value,alarm,timeStamp)";
/// Request used by the convenience writers.
pub const DEFAULT_PUT_REQUEST: &str = "field(value)";

// ── ClientChannel ────────────────────────────────────────────────

/// A named channel on one provider.
///
/// Cheaply cloneable via `Arc<ChannelInner>`. Request objects obtained
/// through the cached entry points ([`get`](Self::get),
/// [`put`](Self::put), ...) are shared: asking twice for the same request
/// text returns the same object.
#[derive(Clone)]
pub struct ClientChannel {
    inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    name: String,
    provider: Arc<dyn ChannelProvider>,
    config: Arc<ClientConfig>,
    state: Mutex<ChannelState>,
    cond: Condvar,
    gets: RequestCache<ClientGet>,
    puts: RequestCache<ClientPut>,
    put_gets: RequestCache<ClientPutGet>,
    processes: RequestCache<ClientProcess>,
    rpcs: RequestCache<ClientRpc>,
    monitors: RequestCache<ClientMonitor>,
}

struct ChannelState {
    connection: ConnectionState,
    issued: bool,
    destroyed: bool,
    transport: Option<Arc<dyn Channel>>,
    listeners: Vec<Callback<ConnectionState>>,
}

impl ClientChannel {
    /// Create a channel facade. Nothing happens on the network until
    /// [`issue_connect`](Self::issue_connect) or [`connect`](Self::connect).
    pub fn new(name: &str, provider: Arc<dyn ChannelProvider>, config: Arc<ClientConfig>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_owned(),
                provider,
                config,
                state: Mutex::new(ChannelState {
                    connection: ConnectionState::NeverConnected,
                    issued: false,
                    destroyed: false,
                    transport: None,
                    listeners: Vec::new(),
                }),
                cond: Condvar::new(),
                gets: RequestCache::new(),
                puts: RequestCache::new(),
                put_gets: RequestCache::new(),
                processes: RequestCache::new(),
                rpcs: RequestCache::new(),
                monitors: RequestCache::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn provider_name(&self) -> &str {
        self.inner.provider.name()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// `true` if both handles refer to the same channel.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.inner.config)
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelInner> {
        Arc::downgrade(&self.inner)
    }

    /// Register a callback for every connection-state change.
    ///
    /// Called on transport threads, never with a channel lock held.
    pub fn add_state_listener(&self, listener: Callback<ConnectionState>) {
        self.inner.state.lock().listeners.push(listener);
    }

    // ── Connection ───────────────────────────────────────────────

    /// Start searching for the channel. Fails if a connect was already
    /// issued.
    pub fn issue_connect(&self) -> Result<(), CoreError> {
        if !self.inner.start_connect()? {
            return Err(CoreError::IllegalState {
                channel: self.inner.name.clone(),
                operation: "channel".into(),
                reason: "connect already issued".into(),
            });
        }
        Ok(())
    }

    /// Issue a connect unless one is already outstanding or done.
    pub(crate) fn request_connect(&self) -> Result<(), CoreError> {
        self.inner.start_connect().map(|_| ())
    }

    /// Block until connected or until `timeout` passes. Zero waits forever.
    ///
    /// A timeout is returned as an error status, not raised.
    pub fn wait_connect(&self, timeout: Duration) -> Result<Status, CoreError> {
        self.inner.wait_connect(wait_limit(timeout))
    }

    /// Issue a connect if needed and wait for it.
    pub fn connect(&self, timeout: Duration) -> Result<(), CoreError> {
        self.inner.connect(timeout)
    }

    // ── Cached request objects ───────────────────────────────────

    /// Cached, connected get for `request`.
    pub fn get(&self, request: &str) -> Result<Arc<ClientGet>, CoreError> {
        let request = self.parse(request)?;
        self.inner.gets.get_or_create(&self.inner.name, request.as_str(), || {
            let get = ClientGet::new(self, request.clone());
            connect_or_destroy(get, |g| g.connect())
        })
    }

    /// Cached, connected put for `request`.
    pub fn put(&self, request: &str) -> Result<Arc<ClientPut>, CoreError> {
        let request = self.parse(request)?;
        self.inner.puts.get_or_create(&self.inner.name, request.as_str(), || {
            let put = ClientPut::new(self, request.clone());
            connect_or_destroy(put, |p| p.connect())
        })
    }

    /// Cached, connected put-get for `request`.
    pub fn put_get(&self, request: &str) -> Result<Arc<ClientPutGet>, CoreError> {
        let request = self.parse(request)?;
        self.inner.put_gets.get_or_create(&self.inner.name, request.as_str(), || {
            let put_get = ClientPutGet::new(self, request.clone());
            connect_or_destroy(put_get, |p| p.connect())
        })
    }

    /// Cached, connected process for `request`.
    pub fn process(&self, request: &str) -> Result<Arc<ClientProcess>, CoreError> {
        let request = self.parse(request)?;
        self.inner.processes.get_or_create(&self.inner.name, request.as_str(), || {
            let process = ClientProcess::new(self, request.clone());
            connect_or_destroy(process, |p| p.connect())
        })
    }

    /// Cached, connected RPC for `request`.
    pub fn rpc(&self, request: &str) -> Result<Arc<ClientRpc>, CoreError> {
        let request = self.parse(request)?;
        self.inner.rpcs.get_or_create(&self.inner.name, request.as_str(), || {
            let rpc = ClientRpc::new(self, request.clone());
            connect_or_destroy(rpc, |r| r.connect())
        })
    }

    /// Cached, connected and started monitor for `request`.
    pub fn monitor(&self, request: &str) -> Result<Arc<ClientMonitor>, CoreError> {
        let request = self.parse(request)?;
        self.inner.monitors.get_or_create(&self.inner.name, request.as_str(), || {
            let monitor = ClientMonitor::new(self, request.clone());
            connect_or_destroy(monitor, |m| {
                m.connect()?;
                m.start()
            })
        })
    }

    // ── Uncached request objects ─────────────────────────────────

    /// A new get that is neither cached nor connected.
    pub fn create_get(&self, request: &str) -> Result<Arc<ClientGet>, CoreError> {
        Ok(ClientGet::new(self, self.parse(request)?))
    }

    pub fn create_put(&self, request: &str) -> Result<Arc<ClientPut>, CoreError> {
        Ok(ClientPut::new(self, self.parse(request)?))
    }

    pub fn create_put_get(&self, request: &str) -> Result<Arc<ClientPutGet>, CoreError> {
        Ok(ClientPutGet::new(self, self.parse(request)?))
    }

    pub fn create_process(&self, request: &str) -> Result<Arc<ClientProcess>, CoreError> {
        Ok(ClientProcess::new(self, self.parse(request)?))
    }

    pub fn create_rpc(&self, request: &str) -> Result<Arc<ClientRpc>, CoreError> {
        Ok(ClientRpc::new(self, self.parse(request)?))
    }

    /// A new monitor that is neither cached, connected nor started.
    pub fn create_monitor(&self, request: &str) -> Result<Arc<ClientMonitor>, CoreError> {
        Ok(ClientMonitor::new(self, self.parse(request)?))
    }

    // ── Conveniences ─────────────────────────────────────────────

    pub fn get_double(&self) -> Result<f64, CoreError> {
        let get = self.get(DEFAULT_GET_REQUEST)?;
        get.get()?;
        get.data()?.get_double()
    }

    pub fn get_string(&self) -> Result<String, CoreError> {
        let get = self.get(DEFAULT_GET_REQUEST)?;
        get.get()?;
        get.data()?.get_string()
    }

    pub fn get_double_array(&self) -> Result<Vec<f64>, CoreError> {
        let get = self.get(DEFAULT_GET_REQUEST)?;
        get.get()?;
        get.data()?.get_double_array()
    }

    pub fn put_double(&self, value: f64) -> Result<(), CoreError> {
        let put = self.put(DEFAULT_PUT_REQUEST)?;
        put.update(|data| data.put_double(value))?;
        put.put()
    }

    pub fn put_string(&self, value: &str) -> Result<(), CoreError> {
        let put = self.put(DEFAULT_PUT_REQUEST)?;
        put.update(|data| data.put_string(value))?;
        put.put()
    }

    pub fn put_double_array(&self, values: &[f64]) -> Result<(), CoreError> {
        let put = self.put(DEFAULT_PUT_REQUEST)?;
        put.update(|data| data.put_double_array(values))?;
        put.put()
    }

    // ── Cache inspection ─────────────────────────────────────────

    /// Number of cached request objects across every kind.
    pub fn cache_size(&self) -> usize {
        let inner = &self.inner;
        inner.gets.len()
            + inner.puts.len()
            + inner.put_gets.len()
            + inner.processes.len()
            + inner.rpcs.len()
            + inner.monitors.len()
    }

    /// One line per cached request object.
    pub fn show_cache(&self) -> String {
        let inner = &self.inner;
        let mut out = String::new();
        let sections = [
            ("get", inner.gets.keys()),
            ("put", inner.puts.keys()),
            ("putGet", inner.put_gets.keys()),
            ("process", inner.processes.keys()),
            ("rpc", inner.rpcs.keys()),
            ("monitor", inner.monitors.keys()),
        ];
        for (kind, keys) in sections {
            for key in keys {
                out.push_str(&format!("{} {kind} \"{key}\"\n", inner.name));
            }
        }
        out
    }

    /// Destroy every cached request object, then the transport channel.
    /// Idempotent.
    pub fn destroy(&self) {
        let inner = &self.inner;
        let (transport, listeners) = {
            let mut state = inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.connection = ConnectionState::Destroyed;
            (state.transport.take(), std::mem::take(&mut state.listeners))
        };
        inner.cond.notify_all();

        inner.gets.destroy_all();
        inner.puts.destroy_all();
        inner.put_gets.destroy_all();
        inner.processes.destroy_all();
        inner.rpcs.destroy_all();
        inner.monitors.destroy_all();

        if let Some(transport) = transport {
            transport.destroy();
        }
        for listener in listeners {
            listener(ConnectionState::Destroyed);
        }
        debug!(channel = %inner.name, "channel destroyed");
    }

    fn parse(&self, request: &str) -> Result<PvRequest, CoreError> {
        if self.inner.state.lock().destroyed {
            return Err(self.inner.destroyed_error());
        }
        Ok(PvRequest::parse(request)?)
    }
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("name", &self.inner.name)
            .field("provider", &self.inner.provider.name())
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

/// Run `connect` on a fresh request object, destroying it on failure so
/// its transport handle is not left behind.
fn connect_or_destroy<T, F>(item: Arc<T>, connect: F) -> Result<Arc<T>, CoreError>
where
    T: Destroy,
    F: FnOnce(&T) -> Result<(), CoreError>,
{
    match connect(&item) {
        Ok(()) => Ok(item),
        Err(e) => {
            item.destroy();
            Err(e)
        }
    }
}

// ── ChannelInner ─────────────────────────────────────────────────

impl ChannelInner {
    fn destroyed_error(&self) -> CoreError {
        CoreError::Destroyed {
            channel: self.name.clone(),
            operation: "channel".into(),
        }
    }

    /// Create the transport channel on first call. `false` if a connect
    /// had already been issued.
    fn start_connect(self: &Arc<Self>) -> Result<bool, CoreError> {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(self.destroyed_error());
            }
            if state.issued {
                return Ok(false);
            }
            state.issued = true;
            state.connection = ConnectionState::Connecting;
        }

        let me = Arc::downgrade(self);
        let on_state: Callback<ConnectionState> = Arc::new(move |next| {
            if let Some(inner) = me.upgrade() {
                inner.on_state(next);
            }
        });

        match self.provider.create_channel(&self.name, on_state) {
            Ok(transport) => {
                let mut state = self.state.lock();
                if state.destroyed {
                    drop(state);
                    transport.destroy();
                    return Err(self.destroyed_error());
                }
                state.transport = Some(transport);
                trace!(channel = %self.name, provider = self.provider.name(), "connect issued");
                Ok(true)
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.issued = false;
                state.connection = ConnectionState::NeverConnected;
                drop(state);
                self.cond.notify_all();
                Err(e.into())
            }
        }
    }

    fn wait_connect(&self, timeout: Option<Duration>) -> Result<Status, CoreError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.destroyed {
                return Err(self.destroyed_error());
            }
            if state.connection == ConnectionState::Connected {
                return Ok(Status::ok());
            }
            if !state.issued {
                return Ok(Status::error(format!("{} connect not issued", self.name)));
            }
            let timed_out = match deadline {
                Some(deadline) => self.cond.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.cond.wait(&mut state);
                    false
                }
            };
            if timed_out && state.connection != ConnectionState::Connected {
                return Ok(Status::timeout(
                    &format!("{} connect", self.name),
                    timeout.unwrap_or_default().as_secs_f64(),
                ));
            }
        }
    }

    fn connect(self: &Arc<Self>, timeout: Duration) -> Result<(), CoreError> {
        self.start_connect()?;
        let status = self.wait_connect(wait_limit(timeout))?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(CoreError::ConnectFailed {
                channel: self.name.clone(),
                operation: "channel".into(),
                status,
            })
        }
    }

    /// The connected transport channel, connecting first if needed.
    pub(crate) fn ensure_connected(self: &Arc<Self>) -> Result<Arc<dyn Channel>, CoreError> {
        {
            let state = self.state.lock();
            if state.destroyed {
                return Err(self.destroyed_error());
            }
            if state.connection == ConnectionState::Connected {
                if let Some(transport) = &state.transport {
                    return Ok(Arc::clone(transport));
                }
            }
        }
        self.connect(self.config.connect_timeout)?;
        let state = self.state.lock();
        match (&state.transport, state.connection) {
            (Some(transport), ConnectionState::Connected) => Ok(Arc::clone(transport)),
            _ => Err(CoreError::NotConnected {
                channel: self.name.clone(),
            }),
        }
    }

    fn on_state(&self, next: ConnectionState) {
        let listeners = {
            let mut state = self.state.lock();
            if state.destroyed || state.connection == next {
                return;
            }
            state.connection = next;
            state.listeners.clone()
        };
        self.cond.notify_all();
        debug!(channel = %self.name, state = %next, "connection state changed");
        for listener in listeners {
            listener(next);
        }
    }
}
