//! Host functions linked into plugin instances
//!
//! The import surface is deliberately small:
//! - `console.{log,info,warn,error,debug}(ptr, len)` rate-limited logging
//! - `timer.now() -> i64` and `timer.sleep(ms)` with a clamped delay
//! - `host.call(ptr, len) -> i32` JSON request into the plugin's capability
//!   API, and `host.response(ptr) -> i32` to copy the reply out
//!
//! Host functions never trap on bad guest input; they return `-1` instead.

use crate::error::PluginResult;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use wasmtime::{Caller, Engine, Func, Linker, Store, StoreLimits, Val};

/// Upper bound on a single guest-supplied buffer
const MAX_GUEST_BUFFER: usize = 1024 * 1024;

const GUEST_LOG_TARGET: &str = "atrium::plugin";

/// The capability surface a plugin instance can call into
pub trait HostApi: Send + Sync {
    fn dispatch(&self, request: HostRequest) -> PluginResult<Value>;
}

/// Request decoded from `host.call`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HostRequest {
    pub api: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

/// Host API for plugins loaded without a capability context
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyHostApi;

impl HostApi for EmptyHostApi {
    fn dispatch(&self, request: HostRequest) -> PluginResult<Value> {
        Err(crate::error::PluginError::ServiceUnavailable(format!(
            "{}.{}",
            request.api, request.method
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl ConsoleLevel {
    const ALL: [ConsoleLevel; 5] = [Self::Log, Self::Info, Self::Warn, Self::Error, Self::Debug];

    fn name(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }
}

/// Fixed-window limiter for guest console output
#[derive(Debug)]
pub(crate) struct ConsoleLimiter {
    per_second: u32,
    window_start: Instant,
    count: u32,
    dropped: u64,
}

impl ConsoleLimiter {
    pub(crate) fn new(per_second: u32) -> Self {
        Self {
            per_second,
            window_start: Instant::now(),
            count: 0,
            dropped: 0,
        }
    }

    pub(crate) fn unlimited() -> Self {
        Self::new(u32::MAX)
    }

    fn admit(&mut self) -> bool {
        if self.window_start.elapsed() >= Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.count = 0;
        }
        if self.count < self.per_second {
            self.count += 1;
            true
        } else {
            self.dropped += 1;
            false
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Per-store state visible to host functions
pub(crate) struct HostState {
    pub(crate) plugin_id: String,
    pub(crate) api: Arc<dyn HostApi>,
    pub(crate) limits: StoreLimits,
    pub(crate) console: ConsoleLimiter,
    pub(crate) max_timer_delay: Duration,
    response: Vec<u8>,
}

impl HostState {
    pub(crate) fn new(
        plugin_id: &str,
        api: Arc<dyn HostApi>,
        limits: StoreLimits,
        console: ConsoleLimiter,
        max_timer_delay: Duration,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            api,
            limits,
            console,
            max_timer_delay,
            response: Vec::new(),
        }
    }
}

/// Build a linker exposing exactly the host import surface
pub(crate) fn build_linker(engine: &Engine) -> wasmtime::Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);

    for level in ConsoleLevel::ALL {
        linker.func_wrap(
            "console",
            level.name(),
            move |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                console_write(&mut caller, level, ptr, len);
            },
        )?;
    }

    linker.func_wrap("timer", "now", || -> i64 { chrono::Utc::now().timestamp_millis() })?;

    linker.func_wrap("timer", "sleep", |caller: Caller<'_, HostState>, ms: i64| {
        let requested = Duration::from_millis(ms.max(0) as u64);
        let delay = requested.min(caller.data().max_timer_delay);
        if delay < requested {
            debug!(
                plugin_id = %caller.data().plugin_id,
                requested_ms = ms,
                clamped_ms = delay.as_millis() as u64,
                "Clamped plugin timer delay"
            );
        }
        std::thread::sleep(delay);
    })?;

    linker.func_wrap(
        "host",
        "call",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> i32 { host_call(&mut caller, ptr, len) },
    )?;

    linker.func_wrap(
        "host",
        "response",
        |mut caller: Caller<'_, HostState>, ptr: i32| -> i32 { copy_response(&mut caller, ptr) },
    )?;

    Ok(linker)
}

/// Call a function export with no arguments, returning its first i32 result
pub(crate) fn call_func(store: &mut Store<HostState>, func: Func) -> wasmtime::Result<Option<i32>> {
    let ty = func.ty(&*store);
    let mut results = vec![Val::I32(0); ty.results().len()];
    func.call(&mut *store, &[], &mut results)?;
    Ok(results.first().and_then(Val::i32))
}

fn console_write(caller: &mut Caller<'_, HostState>, level: ConsoleLevel, ptr: i32, len: i32) {
    let Some(bytes) = read_guest(caller, ptr, len) else {
        return;
    };
    let state = caller.data_mut();
    if !state.console.admit() {
        return;
    }

    let message = String::from_utf8_lossy(&bytes);
    let plugin_id = state.plugin_id.as_str();
    match level {
        ConsoleLevel::Log | ConsoleLevel::Info => {
            info!(target: GUEST_LOG_TARGET, plugin_id, "{message}")
        }
        ConsoleLevel::Warn => warn!(target: GUEST_LOG_TARGET, plugin_id, "{message}"),
        ConsoleLevel::Error => error!(target: GUEST_LOG_TARGET, plugin_id, "{message}"),
        ConsoleLevel::Debug => debug!(target: GUEST_LOG_TARGET, plugin_id, "{message}"),
    }
}

fn host_call(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> i32 {
    let Some(bytes) = read_guest(caller, ptr, len) else {
        return -1;
    };

    let reply = match serde_json::from_slice::<HostRequest>(&bytes) {
        Ok(request) => {
            let api = caller.data().api.clone();
            let label = format!("{}.{}", request.api, request.method);
            match api.dispatch(request) {
                Ok(value) => json!({ "ok": true, "value": value }),
                Err(e) => {
                    debug!(plugin_id = %caller.data().plugin_id, call = %label, error = %e, "Host call failed");
                    json!({ "ok": false, "error": e.to_string(), "code": e.code() })
                }
            }
        }
        Err(e) => json!({ "ok": false, "error": format!("Malformed host request: {e}") }),
    };

    let encoded = reply.to_string().into_bytes();
    let Ok(len) = i32::try_from(encoded.len()) else {
        return -1;
    };
    caller.data_mut().response = encoded;
    len
}

/// Copy the pending response into guest memory at `ptr`; one-shot
fn copy_response(caller: &mut Caller<'_, HostState>, ptr: i32) -> i32 {
    let Ok(offset) = usize::try_from(ptr) else {
        return -1;
    };
    let Some(memory) = caller.get_export("memory").and_then(|e| e.into_memory()) else {
        return -1;
    };

    let response = std::mem::take(&mut caller.data_mut().response);
    let Ok(written) = i32::try_from(response.len()) else {
        return -1;
    };
    match memory.write(&mut *caller, offset, &response) {
        Ok(()) => written,
        Err(_) => -1,
    }
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let offset = usize::try_from(ptr).ok()?;
    let len = usize::try_from(len).ok()?;
    if len > MAX_GUEST_BUFFER {
        return None;
    }

    let memory = caller.get_export("memory")?.into_memory()?;
    let mut buf = vec![0u8; len];
    memory.read(&*caller, offset, &mut buf).ok()?;
    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_limiter_window() {
        let mut limiter = ConsoleLimiter::new(2);
        assert!(limiter.admit());
        assert!(limiter.admit());
        assert!(!limiter.admit());
        assert_eq!(limiter.dropped(), 1);
    }

    #[test]
    fn test_host_request_args_default() {
        let request: HostRequest =
            serde_json::from_str(r#"{"api":"utils","method":"generateId"}"#).unwrap();
        assert_eq!(request.args, Value::Null);
    }

    #[test]
    fn test_empty_api_refuses() {
        let err = EmptyHostApi
            .dispatch(HostRequest {
                api: "entities".into(),
                method: "getTypes".into(),
                args: Value::Null,
            })
            .unwrap_err();
        assert!(err.to_string().contains("entities.getTypes"));
    }
}
