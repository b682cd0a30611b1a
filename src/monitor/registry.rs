//! Lifecycle management for monitor tasks.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::gateway::CancelFlag;
use crate::models::MonitorKey;
use crate::Result;

use super::{MarketMonitor, MonitorDeps};

struct MonitorHandle {
    cancel: CancelFlag,
    task: JoinHandle<()>,
}

/// Owns every running monitor task, keyed by [`MonitorKey`].
///
/// `start` validates synchronously and spawns; `stop` cancels cooperatively
/// and waits for the task to drain.
#[derive(Default)]
pub struct MonitorRegistry {
    monitors: HashMap<MonitorKey, MonitorHandle>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a monitor for `key`. Config problems (invalid key, invalid exit
    /// rules, duplicate key) are reported here, before any task exists.
    pub fn start(&mut self, key: MonitorKey, deps: MonitorDeps) -> Result<()> {
        key.validate()?;
        deps.rules.validate()?;
        if deps.config.window_capacity == 0 || deps.config.initial_lookback == 0 {
            return Err(EngineError::config(
                "monitor window capacity and lookback must be positive",
            ));
        }
        if self.monitors.contains_key(&key) {
            return Err(EngineError::config(format!(
                "monitor {key} is already running"
            )));
        }

        let cancel = CancelFlag::new();
        let monitor = MarketMonitor::new(key.clone(), deps, cancel.clone());
        let task = tokio::spawn(monitor.run());
        self.monitors.insert(key, MonitorHandle { cancel, task });
        Ok(())
    }

    pub fn is_running(&self, key: &MonitorKey) -> bool {
        self.monitors.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Cancel one monitor and wait for its loop to drain.
    pub async fn stop(&mut self, key: &MonitorKey) -> Result<()> {
        let Some(handle) = self.monitors.remove(key) else {
            return Err(EngineError::config(format!("no monitor running for {key}")));
        };
        handle.cancel.cancel();
        if let Err(err) = handle.task.await {
            warn!(key = %key, error = %err, "monitor task ended abnormally");
        }
        info!(key = %key, "monitor stopped");
        Ok(())
    }

    /// Cancel everything, then wait for each task. Cancellation is flagged
    /// first so the monitors wind down in parallel.
    pub async fn stop_all(&mut self) {
        for handle in self.monitors.values() {
            handle.cancel.cancel();
        }
        for (key, handle) in self.monitors.drain() {
            if let Err(err) = handle.task.await {
                warn!(key = %key, error = %err, "monitor task ended abnormally");
            }
        }
        info!("all monitors stopped");
    }
}
