//! Background epoch ticker driving wall-clock deadlines

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;
use wasmtime::Engine;

pub(crate) const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// Increments the engine epoch every `tick` until dropped
pub(crate) struct EpochTicker {
    tick: Duration,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    pub(crate) fn start(engine: Engine, tick: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("atrium-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(tick);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| warn!(error = %e, "Failed to spawn epoch ticker; sandbox deadlines are disabled"))
            .ok();

        Self { tick, stop, handle }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Deadline in ticks for a timeout; always at least one tick
    pub(crate) fn ticks_for(&self, timeout: Duration) -> u64 {
        let tick = self.tick.as_millis().max(1);
        let ticks = timeout.as_millis().div_ceil(tick);
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_for_rounds_up() {
        let ticker = EpochTicker::start(Engine::default(), Duration::from_millis(10));
        assert_eq!(ticker.ticks_for(Duration::from_millis(5_000)), 500);
        assert_eq!(ticker.ticks_for(Duration::from_millis(15)), 2);
        assert_eq!(ticker.ticks_for(Duration::ZERO), 1);
        assert!(ticker.is_running());
    }
}
