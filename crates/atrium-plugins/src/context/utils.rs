//! Ungated helpers available to every plugin

use chrono::{DateTime, Local, SecondsFormat, Utc};
use rand::Rng;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const ID_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `id_<unix ms>_<9 base36 chars>`
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("id_{}_{suffix}", Utc::now().timestamp_millis())
}

/// Format `date`; `YYYY-MM-DD` and `YYYY-MM-DD HH:mm:ss` use local time,
/// anything else (including `default`) yields an ISO-8601 UTC timestamp
pub fn format_date(date: DateTime<Utc>, format: Option<&str>) -> String {
    let local = date.with_timezone(&Local);
    match format {
        Some("YYYY-MM-DD") => local.format("%Y-%m-%d").to_string(),
        Some("YYYY-MM-DD HH:mm:ss") => local.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => date.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

pub fn deep_clone(value: &Value) -> Value {
    value.clone()
}

/// Runs only the last of a burst of calls, `wait` after the burst ends
///
/// Must be used from within a tokio runtime.
#[derive(Debug)]
pub struct Debouncer {
    wait: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            pending: Mutex::new(None),
        }
    }

    pub fn call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let wait = self.wait;
        let mut pending = lock(&self.pending);
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            f();
        }));
    }

    pub fn cancel(&self) {
        if let Some(previous) = lock(&self.pending).take() {
            previous.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_run: Option<Instant>,
    trailing: bool,
}

/// Runs at most once per `wait`; a call inside the window schedules one
/// trailing run at the window's end
#[derive(Debug, Clone)]
pub struct Throttle {
    wait: Duration,
    state: Arc<Mutex<ThrottleState>>,
}

impl Throttle {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            state: Arc::new(Mutex::new(ThrottleState::default())),
        }
    }

    pub fn call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let elapsed = state.last_run.map(|last| now.duration_since(last));

        match elapsed {
            Some(elapsed) if elapsed < self.wait => {
                if state.trailing {
                    return;
                }
                state.trailing = true;
                let remaining = self.wait - elapsed;
                let shared = Arc::clone(&self.state);
                tokio::spawn(async move {
                    tokio::time::sleep(remaining).await;
                    {
                        let mut state = lock(&shared);
                        state.last_run = Some(Instant::now());
                        state.trailing = false;
                    }
                    f();
                });
            }
            _ => {
                state.last_run = Some(now);
                drop(state);
                f();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
