// ── Client context ──
//
// Explicit replacement for a process-wide registry: holds the registered
// providers and a channel cache keyed by (name, provider). Every channel
// and aggregate is created through one of these, and destroying it (or
// dropping the last handle) destroys every cached channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use pvac_api::ChannelProvider;
use tracing::{debug, info};

use crate::channel::ClientChannel;
use crate::config::ClientConfig;
use crate::error::CoreError;
use crate::multi::MultiChannel;

/// Entry point of the blocking client.
///
/// Cheaply cloneable via `Arc<ClientInner>`; clones share providers,
/// configuration and the channel cache.
#[derive(Clone)]
pub struct PvaClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ArcSwap<ClientConfig>,
    providers: DashMap<String, Arc<dyn ChannelProvider>>,
    channels: DashMap<(String, String), ClientChannel>,
    destroyed: AtomicBool,
}

impl PvaClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config: ArcSwap::from_pointee(config),
                providers: DashMap::new(),
                channels: DashMap::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Make a provider available under its own name, replacing any
    /// provider registered under the same name.
    pub fn register_provider<P>(&self, provider: P)
    where
        P: ChannelProvider + 'static,
    {
        let name = provider.name().to_owned();
        debug!(provider = %name, "provider registered");
        self.inner.providers.insert(name, Arc::new(provider));
    }

    /// Registered provider names, sorted.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.providers.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    /// The active configuration.
    pub fn config(&self) -> Arc<ClientConfig> {
        self.inner.config.load_full()
    }

    /// Replace the configuration. Channels created from now on use it;
    /// existing ones keep the one they were created with.
    pub fn set_config(&self, config: ClientConfig) {
        self.inner.config.store(Arc::new(config));
    }

    // ── Channels ─────────────────────────────────────────────────

    /// Cached channel on the default provider, connected with the
    /// configured timeout.
    pub fn channel(&self, name: &str) -> Result<ClientChannel, CoreError> {
        let config = self.config();
        self.channel_with(name, &config.default_provider, config.connect_timeout)
    }

    /// Cached channel on `provider`, connected within `timeout`.
    pub fn channel_with(
        &self,
        name: &str,
        provider: &str,
        timeout: Duration,
    ) -> Result<ClientChannel, CoreError> {
        let channel = self.create_channel(name, provider)?;
        channel.connect(timeout)?;
        Ok(channel)
    }

    /// Cached channel on `provider`. Not connected.
    ///
    /// Asking again for the same (name, provider) returns the same
    /// channel.
    pub fn create_channel(&self, name: &str, provider: &str) -> Result<ClientChannel, CoreError> {
        self.live()?;
        let key = (name.to_owned(), provider.to_owned());
        if let Some(channel) = self.inner.channels.get(&key) {
            return Ok(channel.value().clone());
        }
        let transport = self.provider(provider)?;
        let channel = self
            .inner
            .channels
            .entry(key)
            .or_insert_with(|| ClientChannel::new(name, transport, self.config()))
            .value()
            .clone();
        Ok(channel)
    }

    /// A multi-channel set over cached channels on `provider`.
    pub fn create_multi_channel<S: AsRef<str>>(
        &self,
        names: &[S],
        provider: &str,
    ) -> Result<MultiChannel, CoreError> {
        let channels = names
            .iter()
            .map(|name| self.create_channel(name.as_ref(), provider))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MultiChannel::new(provider, self.config(), channels))
    }

    // ── Cache ────────────────────────────────────────────────────

    /// Number of cached channels.
    pub fn cache_size(&self) -> usize {
        self.inner.channels.len()
    }

    /// Every cached channel with its state and request cache.
    pub fn show_cache(&self) -> String {
        let mut channels: Vec<ClientChannel> =
            self.inner.channels.iter().map(|c| c.value().clone()).collect();
        channels.sort_by(|a, b| (a.name(), a.provider_name()).cmp(&(b.name(), b.provider_name())));
        let mut out = String::new();
        for channel in channels {
            out.push_str(&format!(
                "channel {} provider {} state {}\n",
                channel.name(),
                channel.provider_name(),
                channel.connection_state()
            ));
            out.push_str(&channel.show_cache());
        }
        out
    }

    /// Destroy every cached channel. Idempotent; later calls that create
    /// channels fail.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    fn provider(&self, name: &str) -> Result<Arc<dyn ChannelProvider>, CoreError> {
        self.inner
            .providers
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| CoreError::UnknownProvider {
                provider: name.to_owned(),
            })
    }

    fn live(&self) -> Result<(), CoreError> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(CoreError::Destroyed {
                channel: "client".into(),
                operation: "context".into(),
            });
        }
        Ok(())
    }
}

impl Default for PvaClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl std::fmt::Debug for PvaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PvaClient")
            .field("providers", &self.provider_names())
            .field("channels", &self.cache_size())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let keys: Vec<(String, String)> = self.channels.iter().map(|c| c.key().clone()).collect();
        let count = keys.len();
        for key in keys {
            if let Some((_, channel)) = self.channels.remove(&key) {
                channel.destroy();
            }
        }
        info!(channels = count, "client destroyed");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.destroy();
    }
}
