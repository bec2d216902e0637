// ── Per-channel request cache ──
//
// Concurrent map from normalized request text to a shared request object.
// Append-mostly: entries live until the owning channel is destroyed.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::CoreError;
use crate::monitor::ClientMonitor;
use crate::request::{ClientGet, ClientProcess, ClientPut, ClientPutGet, ClientRpc};

/// Cached objects hold transport handles that must be released.
pub(crate) trait Destroy {
    fn destroy(&self);
}

impl Destroy for ClientGet {
    fn destroy(&self) {
        ClientGet::destroy(self);
    }
}

impl Destroy for ClientPut {
    fn destroy(&self) {
        ClientPut::destroy(self);
    }
}

impl Destroy for ClientPutGet {
    fn destroy(&self) {
        ClientPutGet::destroy(self);
    }
}

impl Destroy for ClientProcess {
    fn destroy(&self) {
        ClientProcess::destroy(self);
    }
}

impl Destroy for ClientRpc {
    fn destroy(&self) {
        ClientRpc::destroy(self);
    }
}

impl Destroy for ClientMonitor {
    fn destroy(&self) {
        ClientMonitor::destroy(self);
    }
}

pub(crate) struct RequestCache<T> {
    by_request: DashMap<String, Arc<T>>,
}

impl<T> RequestCache<T> {
    pub(crate) fn new() -> Self {
        Self {
            by_request: DashMap::new(),
        }
    }

    pub(crate) fn get(&self, request: &str) -> Option<Arc<T>> {
        self.by_request.get(request).map(|r| Arc::clone(r.value()))
    }

    /// Insert a freshly created request object.
    ///
    /// A second insert under the same key means two request objects were
    /// built for one request, which is refused.
    pub(crate) fn insert(&self, channel: &str, request: &str, item: Arc<T>) -> Result<(), CoreError> {
        match self.by_request.entry(request.to_owned()) {
            Entry::Occupied(_) => Err(CoreError::DuplicateCacheEntry {
                channel: channel.to_owned(),
                request: request.to_owned(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(item);
                Ok(())
            }
        }
    }

    /// The cached object for `request`, or one built by `create`.
    ///
    /// `create` runs without any cache lock held, so two callers may both
    /// build one. The first to finish is cached and returned to both; the
    /// other's object is destroyed.
    pub(crate) fn get_or_create<F>(
        &self,
        channel: &str,
        request: &str,
        create: F,
    ) -> Result<Arc<T>, CoreError>
    where
        T: Destroy,
        F: FnOnce() -> Result<Arc<T>, CoreError>,
    {
        if let Some(item) = self.get(request) {
            return Ok(item);
        }
        let item = create()?;
        match self.insert(channel, request, Arc::clone(&item)) {
            Ok(()) => Ok(item),
            Err(conflict) => {
                item.destroy();
                self.get(request).ok_or(conflict)
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_request.len()
    }

    /// Destroy every cached object and empty the cache.
    pub(crate) fn destroy_all(&self)
    where
        T: Destroy,
    {
        for item in self.drain() {
            item.destroy();
        }
    }

    /// Cached request texts, sorted.
    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.by_request.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Empty the cache, handing back everything it held.
    pub(crate) fn drain(&self) -> Vec<Arc<T>> {
        let keys: Vec<String> = self.by_request.iter().map(|r| r.key().clone()).collect();
        keys.iter()
            .filter_map(|k| self.by_request.remove(k).map(|(_, v)| v))
            .collect()
    }
}
