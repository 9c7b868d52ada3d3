//! Wasm runtime handle: one wasmtime `Engine`/`Module` pair per loaded
//! digest, re-instantiated into a fresh `Store` for every call.
//!
//! Calls exchange data with the guest over stdio: the payload is written to
//! stdin, the entrypoint name is passed as the `IGNITION_ENTRYPOINT`
//! environment variable, and the guest's stdout becomes the raw response
//! bytes (content-type is whatever the plugin emits; this layer never parses
//! it). Per-call timeouts are enforced with wasmtime epoch interruption: a
//! single background ticker shared by every loaded function advances the
//! engine's epoch, and each call sets its own deadline in epoch ticks before
//! invoking the guest.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use wasmtime::{Config, Engine, Linker, Module, ResourceLimiter, Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::preview1::{add_to_linker_sync, WasiP1Ctx};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::WasiCtxBuilder;

use crate::error::EngineError;

/// How often the epoch ticker advances the shared engine's epoch. Per-call
/// deadlines are expressed in multiples of this tick.
pub const EPOCH_TICK: Duration = Duration::from_millis(20);

/// Per-slot resource caps and toggles, resolved at load time from the
/// function's registered [`crate::registry::VersionSettings`] plus any
/// `MAX_MEMORY_MB` / `TIMEOUT_MILLIS` entries in the load's config map.
#[derive(Clone, Debug, PartialEq)]
pub struct PluginOptions {
    pub wasi: bool,
    pub allowed_urls: Vec<String>,
    pub max_memory_mb: Option<u64>,
    pub timeout_millis: u64,
}

impl PluginOptions {
    fn epoch_ticks(&self) -> u64 {
        let ticks = self.timeout_millis / EPOCH_TICK.as_millis().max(1) as u64;
        ticks.max(1)
    }
}

/// Construct the single wasmtime [`Engine`] shared by every loaded function,
/// with epoch interruption enabled, and spawn the background ticker task
/// that advances its epoch. Call once at daemon startup.
pub fn new_shared_engine() -> Result<Engine> {
    let mut config = Config::new();
    config.async_support(false);
    config.epoch_interruption(true);
    let engine = Engine::new(&config).context("error constructing wasmtime engine")?;

    let ticker_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(EPOCH_TICK).await;
            ticker_engine.increment_epoch();
        }
    });

    Ok(engine)
}

struct HostState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

impl ResourceLimiter for HostState {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> Result<bool> {
        self.limits.memory_growing(current, desired, maximum)
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> Result<bool> {
        self.limits.table_growing(current, desired, maximum)
    }
}

/// The outcome of a single call into a guest module.
pub struct CallOutcome {
    pub response: Vec<u8>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

/// A compiled Wasm module plus the resource caps it was loaded with. Cheap
/// to clone: `Engine` and `Module` are `Arc`-backed internally.
#[derive(Clone)]
pub struct RuntimeHandle {
    engine: Engine,
    module: Arc<Module>,
    options: PluginOptions,
}

impl RuntimeHandle {
    #[tracing::instrument(level = "debug", skip(engine, bytes, options))]
    pub fn load(engine: &Engine, bytes: &[u8], options: PluginOptions) -> Result<Self> {
        let module = Module::new(engine, bytes).context("error compiling wasm module")?;
        Ok(Self {
            engine: engine.clone(),
            module: Arc::new(module),
            options,
        })
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    /// Instantiate a fresh store, run `entrypoint` against `payload`, and
    /// capture stdout/stderr. Runs on a blocking thread since wasmtime's
    /// synchronous API must not block a tokio worker.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(entrypoint))]
    pub async fn call(&self, entrypoint: &str, payload: Vec<u8>) -> Result<CallOutcome, EngineError> {
        let engine = self.engine.clone();
        let module = self.module.clone();
        let options = self.options.clone();
        let entrypoint = entrypoint.to_string();

        let deadline = tokio::time::Duration::from_millis(options.timeout_millis);
        let join = tokio::task::spawn_blocking(move || {
            run_instance(&engine, &module, &options, &entrypoint, &payload)
        });

        match tokio::time::timeout(deadline, join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EngineError::PluginError(format!(
                "plugin task panicked: {join_err}"
            ))),
            Err(_) => Err(EngineError::Timeout(options.timeout_millis)),
        }
    }
}

fn run_instance(
    engine: &Engine,
    module: &Module,
    options: &PluginOptions,
    entrypoint: &str,
    payload: &[u8],
) -> Result<CallOutcome, EngineError> {
    let stdout_pipe = MemoryOutputPipe::new(1024 * 1024);
    let stderr_pipe = MemoryOutputPipe::new(64 * 1024);

    let mut wasi_builder = WasiCtxBuilder::new();
    wasi_builder
        .stdin(MemoryInputPipe::new(bytes::Bytes::copy_from_slice(payload)))
        .stdout(stdout_pipe.clone())
        .stderr(stderr_pipe.clone())
        .env("IGNITION_ENTRYPOINT", entrypoint);
    if options.wasi {
        wasi_builder.inherit_env();
    }
    let wasi = wasi_builder.build_p1();

    let limits = StoreLimitsBuilder::new()
        .memory_size(options.max_memory_mb.map(|mb| (mb as usize) * 1024 * 1024).unwrap_or(usize::MAX))
        .build();

    let mut store = Store::new(engine, HostState { wasi, limits });
    store.limiter(|state| state as &mut dyn ResourceLimiter);
    store.set_epoch_deadline(options.epoch_ticks());

    let mut linker: Linker<HostState> = Linker::new(engine);
    add_to_linker_sync(&mut linker, |s: &mut HostState| &mut s.wasi)
        .map_err(|e| EngineError::PluginError(format!("error wiring WASI imports: {e}")))?;

    let instance = linker
        .instantiate(&mut store, module)
        .map_err(|e| EngineError::PluginError(format!("error instantiating module: {e}")))?;

    let start = instance
        .get_typed_func::<(), ()>(&mut store, "_start")
        .map_err(|e| EngineError::PluginError(format!("module has no `_start` export: {e}")))?;

    let call_result = start.call(&mut store, ());
    drop(store);

    let stdout = stdout_pipe.contents();
    let stderr = stderr_pipe.contents();
    let stderr_lines: Vec<String> = String::from_utf8_lossy(&stderr)
        .lines()
        .map(str::to_string)
        .collect();
    let stdout_lines: Vec<String> = String::from_utf8_lossy(&stdout)
        .lines()
        .map(str::to_string)
        .collect();

    // A clean `proc_exit(0)` surfaces as a trap; anything else is a genuine
    // plugin error as long as WASI didn't already capture a deadline trap.
    if let Err(trap) = call_result {
        let message = trap.to_string();
        if message.contains("epoch deadline") {
            return Err(EngineError::Timeout(options.timeout_millis));
        }
        if !message.contains("exit status") && !message.contains("proc_exit") {
            return Err(EngineError::PluginError(message));
        }
    }

    Ok(CallOutcome {
        response: stdout.to_vec(),
        stdout_lines,
        stderr_lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_ticks_rounds_up_to_at_least_one() {
        let options = PluginOptions {
            wasi: false,
            allowed_urls: Vec::new(),
            max_memory_mb: None,
            timeout_millis: 5,
        };
        assert_eq!(options.epoch_ticks(), 1);
    }
}
