//! Invoker (C7): serialises `Call`/`OneOffCall` against a loaded instance.
//!
//! A slot read-lock is all that is held here — concurrent calls against the
//! same function proceed side by side, while `Load`/`Stop`/`Unload` exclude
//! them via the slot's write-lock (see `cache::InstanceCache`). The runtime
//! handle itself enforces the per-call timeout (epoch interruption); this
//! module is responsible for the state check, the log capture, and shaping
//! the result the control plane returns.

use std::time::{Duration, Instant};

use crate::cache::{Slot, SlotState};
use crate::error::EngineError;

#[tracing::instrument(level = "debug", skip(slot, payload), fields(namespace = slot.namespace(), name = slot.name()))]
pub async fn invoke(
    slot: &Slot,
    entrypoint: &str,
    payload: Vec<u8>,
) -> Result<(Vec<u8>, Duration), EngineError> {
    let runtime = {
        let inner = slot.inner().read().await;
        if inner.state() == SlotState::Stopped {
            return Err(EngineError::Stopped(format!(
                "{}/{} is stopped",
                slot.namespace(),
                slot.name()
            )));
        }
        inner
            .runtime()
            .cloned()
            .expect("a Running slot always carries a runtime handle")
    };
    slot.touch();

    let started = Instant::now();
    let outcome = runtime.call(entrypoint, payload).await?;
    let elapsed = started.elapsed();

    for line in &outcome.stdout_lines {
        slot.logs().append(line.clone());
    }
    for line in &outcome.stderr_lines {
        slot.logs().append(format!("stderr: {line}"));
    }

    Ok((outcome.response, elapsed))
}
