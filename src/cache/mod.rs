//! Instance cache (C6): owns the hot in-memory state — one loaded Wasm
//! instance per `(namespace, name)`, tracked through a small state machine
//! (`Running` / `Stopped`, absence meaning `Unloaded`).
//!
//! Membership changes (insert/remove) go through a coarse lock over the
//! slot map; state changes within a slot go through that slot's own lock, so
//! concurrent `Call`s against one function are allowed to run side by side
//! (read-lock) while `Load`/`Stop`/`Unload` exclude them (write-lock).
//! Concurrent `Load`s of the *same* key are coalesced through a per-key
//! single-flight mutex — `trunk-rs-trunk`'s `BusyDebouncer` collapses the
//! same way, followers simply observe the in-flight load's result here
//! instead of a broadcast value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, RwLock};
use wasmtime::Engine;

use crate::digest::{FullDigest, ShortDigest};
use crate::error::EngineError;
use crate::logs::LogRing;
use crate::registry::{Registry, VersionSettings};
use crate::runtime::{PluginOptions, RuntimeHandle};

type Key = (String, String);

fn key_of(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    Running,
    Stopped,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

pub(crate) struct SlotInner {
    state: SlotState,
    short_digest: ShortDigest,
    full_digest: FullDigest,
    config: HashMap<String, String>,
    runtime: Option<RuntimeHandle>,
}

impl SlotInner {
    pub(crate) fn state(&self) -> SlotState {
        self.state
    }

    pub(crate) fn runtime(&self) -> Option<&RuntimeHandle> {
        self.runtime.as_ref()
    }
}

/// In-memory record for one loaded function. `last_used` lives outside the
/// state lock so a `Call` only ever needs a read-lock on `inner`.
pub struct Slot {
    namespace: String,
    name: String,
    inner: RwLock<SlotInner>,
    last_used_unix_millis: AtomicI64,
    logs: Arc<LogRing>,
}

impl Slot {
    pub fn logs(&self) -> &LogRing {
        &self.logs
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn inner(&self) -> &RwLock<SlotInner> {
        &self.inner
    }

    pub(crate) fn touch(&self) {
        let now = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        self.last_used_unix_millis.store(now as i64, Ordering::Relaxed);
    }
}

/// Result of a successful `Load`.
#[derive(Clone, Debug)]
pub struct LoadOutcome {
    pub namespace: String,
    pub name: String,
    pub digest: ShortDigest,
    pub load_time: Duration,
}

/// A snapshot entry for `/loaded` and `List()`.
#[derive(Clone, Debug)]
pub struct LoadedEntry {
    pub namespace: String,
    pub name: String,
    pub status: SlotState,
}

/// Derive the effective [`PluginOptions`] for a load from the function's
/// registered settings plus any `MAX_MEMORY_MB` / `TIMEOUT_MILLIS` overrides
/// in the load's config map, falling back to the engine's configured
/// default timeout.
fn resolve_plugin_options(
    settings: &VersionSettings,
    config: &HashMap<String, String>,
    default_timeout_millis: u64,
) -> PluginOptions {
    let max_memory_mb = config.get("MAX_MEMORY_MB").and_then(|v| v.parse().ok());
    let timeout_millis = config
        .get("TIMEOUT_MILLIS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_timeout_millis);
    PluginOptions {
        wasi: settings.wasi,
        allowed_urls: settings.allowed_urls.clone(),
        max_memory_mb,
        timeout_millis,
    }
}

/// Owns every loaded instance slot plus the per-key single-flight locks that
/// serialize concurrent loads of the same function.
pub struct InstanceCache {
    registry: Registry,
    engine: Engine,
    slots: RwLock<HashMap<Key, Arc<Slot>>>,
    load_locks: AsyncMutex<HashMap<Key, Arc<AsyncMutex<()>>>>,
    log_ring_capacity: usize,
    default_timeout_millis: u64,
}

impl InstanceCache {
    pub fn new(
        registry: Registry,
        engine: Engine,
        log_ring_capacity: usize,
        default_timeout_millis: u64,
    ) -> Self {
        Self {
            registry,
            engine,
            slots: RwLock::new(HashMap::new()),
            load_locks: AsyncMutex::new(HashMap::new()),
            log_ring_capacity,
            default_timeout_millis,
        }
    }

    async fn load_lock_for(&self, key: &Key) -> Arc<AsyncMutex<()>> {
        let mut locks = self.load_locks.lock().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Resolve `reference` via the registry and load it into the slot for
    /// `(namespace, name)`. Idempotent when the slot already holds the same
    /// digest and config and is not `Stopped`.
    #[tracing::instrument(level = "debug", skip(self, config))]
    pub async fn load(
        &self,
        namespace: &str,
        name: &str,
        reference: &str,
        config: HashMap<String, String>,
        force: bool,
    ) -> Result<LoadOutcome, EngineError> {
        let started = Instant::now();
        let key = key_of(namespace, name);

        let lock = self.load_lock_for(&key).await;
        let _guard = lock.lock().await;

        let (payload, resolved) = self.registry.pull(namespace, name, reference).await?;
        let settings = self
            .registry
            .get(namespace, name)
            .map_err(EngineError::Internal)?
            .map(|m| m.settings)
            .unwrap_or_default();

        let existing = {
            let slots = self.slots.read().await;
            slots.get(&key).cloned()
        };

        if let Some(slot) = &existing {
            let inner = slot.inner.read().await;
            let same_target =
                inner.short_digest == resolved.short_digest && inner.config == config;
            if same_target && inner.state != SlotState::Stopped {
                return Ok(LoadOutcome {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    digest: inner.short_digest.clone(),
                    load_time: started.elapsed(),
                });
            }
            if inner.state == SlotState::Stopped && !force {
                return Err(EngineError::Stopped(format!(
                    "{namespace}/{name} is stopped"
                )));
            }
        }

        let options = resolve_plugin_options(&settings, &config, self.default_timeout_millis);
        let runtime = RuntimeHandle::load(&self.engine, &payload, options)
            .map_err(EngineError::Internal)?;

        let slot = Arc::new(Slot {
            namespace: namespace.to_string(),
            name: name.to_string(),
            inner: RwLock::new(SlotInner {
                state: SlotState::Running,
                short_digest: resolved.short_digest.clone(),
                full_digest: resolved.full_digest.clone(),
                config,
                runtime: Some(runtime),
            }),
            last_used_unix_millis: AtomicI64::new(0),
            logs: Arc::new(LogRing::new(self.log_ring_capacity)),
        });
        slot.touch();

        self.slots.write().await.insert(key, slot);

        Ok(LoadOutcome {
            namespace: namespace.to_string(),
            name: name.to_string(),
            digest: resolved.short_digest,
            load_time: started.elapsed(),
        })
    }

    /// Invoke `entrypoint` against the loaded instance, auto-loading
    /// `"latest"` first if the slot is currently absent. A `config` that
    /// differs from the slot's currently loaded config (e.g. a per-call
    /// `TIMEOUT_MILLIS` override) triggers a reload at the same digest
    /// before the call, following `load`'s own replace-on-diff rule; a
    /// `Stopped` slot is left untouched so the call still fails `Stopped`.
    #[tracing::instrument(level = "debug", skip(self, payload, config))]
    pub async fn call(
        &self,
        namespace: &str,
        name: &str,
        entrypoint: &str,
        payload: Vec<u8>,
        config: HashMap<String, String>,
    ) -> Result<(Vec<u8>, Duration), EngineError> {
        let key = key_of(namespace, name);

        let slot = {
            let slots = self.slots.read().await;
            slots.get(&key).cloned()
        };

        let slot = match slot {
            Some(slot) => {
                let (current_digest, needs_reload) = {
                    let inner = slot.inner.read().await;
                    (
                        inner.short_digest.to_string(),
                        inner.state != SlotState::Stopped && inner.config != config,
                    )
                };
                if needs_reload {
                    self.load(namespace, name, &current_digest, config, false)
                        .await?;
                    let slots = self.slots.read().await;
                    slots
                        .get(&key)
                        .cloned()
                        .ok_or_else(|| EngineError::NotFound(format!("{namespace}/{name}")))?
                } else {
                    slot
                }
            }
            None => {
                if self
                    .registry
                    .get(namespace, name)
                    .map_err(EngineError::Internal)?
                    .is_none()
                {
                    return Err(EngineError::NotFound(format!("{namespace}/{name}")));
                }
                self.load(namespace, name, "latest", config, false).await?;
                let slots = self.slots.read().await;
                slots
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| EngineError::NotFound(format!("{namespace}/{name}")))?
            }
        };

        crate::invoker::invoke(&slot, entrypoint, payload).await
    }

    /// Transition `Running -> Stopped`, tearing down the runtime handle.
    /// Suppresses auto-reload on the next `Call`; the slot itself persists.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn stop(&self, namespace: &str, name: &str) -> Result<(), EngineError> {
        let key = key_of(namespace, name);
        let slot = {
            let slots = self.slots.read().await;
            slots.get(&key).cloned()
        };
        let slot = slot.ok_or_else(|| EngineError::NotFound(format!("{namespace}/{name}")))?;

        let mut inner = slot.inner.write().await;
        inner.state = SlotState::Stopped;
        inner.runtime = None;
        Ok(())
    }

    /// Remove the slot entirely; a subsequent `Call` auto-loads.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn unload(&self, namespace: &str, name: &str) -> Result<(), EngineError> {
        let key = key_of(namespace, name);
        let removed = self.slots.write().await.remove(&key);
        removed
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("{namespace}/{name}")))
    }

    /// Tear down every loaded slot, dropping their runtime handles. Called
    /// on daemon shutdown so in-flight wasmtime instances are released
    /// before the process exits.
    pub async fn unload_all(&self) {
        self.slots.write().await.clear();
    }

    /// Snapshot of every slot with its current state.
    pub async fn list(&self) -> Vec<LoadedEntry> {
        let slots = self.slots.read().await;
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots.values() {
            let inner = slot.inner.read().await;
            out.push(LoadedEntry {
                namespace: slot.namespace.clone(),
                name: slot.name.clone(),
                status: inner.state,
            });
        }
        out
    }

    /// Look up the log ring for a currently loaded function, if any.
    pub async fn logs(&self, namespace: &str, name: &str) -> Option<Arc<LogRing>> {
        let slots = self.slots.read().await;
        slots
            .get(&key_of(namespace, name))
            .map(|slot| slot.logs.clone())
    }

    /// Build a temporary instance from a pulled blob, invoke it once, and
    /// discard it. Never reads or mutates the cache's slot map.
    #[tracing::instrument(level = "debug", skip(self, payload, config))]
    pub async fn one_off_call(
        &self,
        namespace: &str,
        name: &str,
        reference: &str,
        entrypoint: &str,
        payload: Vec<u8>,
        config: HashMap<String, String>,
    ) -> Result<Vec<u8>, EngineError> {
        let (blob, _resolved) = self.registry.pull(namespace, name, reference).await?;
        let settings = self
            .registry
            .get(namespace, name)
            .map_err(EngineError::Internal)?
            .map(|m| m.settings)
            .unwrap_or_default();

        let options = resolve_plugin_options(&settings, &config, self.default_timeout_millis);
        let runtime =
            RuntimeHandle::load(&self.engine, &blob, options).map_err(EngineError::Internal)?;
        let outcome = runtime.call(entrypoint, payload).await?;
        Ok(outcome.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::compute_full_digest;
    use crate::registry::VersionSettings;
    use crate::store::{metadata::MetadataStore, ContentStore};

    fn cache() -> InstanceCache {
        let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        let content = ContentStore::new(dir.path());
        let metadata = MetadataStore::open_temporary().unwrap();
        let registry = Registry::new(content, metadata);
        let engine = crate::runtime::new_shared_engine().unwrap();
        InstanceCache::new(registry, engine, 64, 5_000)
    }

    async fn push_trivial(cache: &InstanceCache, ns: &str, name: &str, tag: &str) -> ShortDigest {
        let manifest = serde_json::json!({});
        let digest = compute_full_digest(b"not-real-wasm", &manifest);
        cache
            .registry
            .push(
                ns,
                name,
                b"not-real-wasm",
                &digest,
                Some(tag),
                &manifest,
                VersionSettings::default(),
            )
            .await
            .unwrap();
        digest.short()
    }

    #[tokio::test]
    async fn unload_missing_function_is_not_found() {
        let cache = cache();
        let err = cache.unload("default", "nope").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn stop_missing_function_is_not_found() {
        let cache = cache();
        let err = cache.stop("default", "nope").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn call_on_unknown_function_is_not_found() {
        let cache = cache();
        let err = cache
            .call("default", "nope", "handle", Vec::new(), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_is_empty_until_loaded() {
        let cache = cache();
        push_trivial(&cache, "default", "hello", "latest").await;
        assert!(cache.list().await.is_empty());
    }

    #[tokio::test]
    async fn stop_then_load_without_force_refuses() {
        // Loading a genuine wasm blob would require an actual compiled
        // module, so this exercises only the pre-load gating logic: a
        // Stopped slot refuses a non-forced reload before ever touching the
        // runtime. We insert a Stopped slot directly to isolate that path.
        let cache = cache();
        push_trivial(&cache, "default", "hello", "latest").await;

        let key = key_of("default", "hello");
        let slot = Arc::new(Slot {
            namespace: "default".into(),
            name: "hello".into(),
            inner: RwLock::new(SlotInner {
                state: SlotState::Stopped,
                short_digest: ShortDigest::parse(&"a".repeat(16)).unwrap(),
                full_digest: FullDigest::parse(&"a".repeat(64)).unwrap(),
                config: HashMap::new(),
                runtime: None,
            }),
            last_used_unix_millis: AtomicI64::new(0),
            logs: Arc::new(LogRing::new(16)),
        });
        cache.slots.write().await.insert(key, slot);

        let err = cache
            .load("default", "hello", "latest", HashMap::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Stopped(_)));
    }
}
