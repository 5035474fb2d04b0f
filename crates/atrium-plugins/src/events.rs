//! Shared publish/subscribe event bus
//!
//! Topics are plain strings. Some prefixes are reserved:
//! - `system:`, `app:` and `window:` belong to the host
//! - `plugin:` belongs to the plugin manager, except `plugin:<id>:` which is
//!   the namespace plugin `<id>` may publish into
//!
//! Anything else is private to the plugin that uses it and never reaches the
//! shared bus.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

const HOST_PREFIXES: [&str; 3] = ["system:", "app:", "window:"];
const PLUGIN_PREFIX: &str = "plugin:";

/// Well-known topics
pub mod topics {
    pub const APP_READY: &str = "app:ready";
    pub const APP_BEFORE_QUIT: &str = "app:before-quit";
    pub const WINDOW_CREATED: &str = "window:created";
    pub const WINDOW_CLOSED: &str = "window:closed";
    pub const PLUGIN_LOADED: &str = "plugin:loaded";
    pub const PLUGIN_INITIALIZED: &str = "plugin:initialized";
    pub const PLUGIN_ACTIVATED: &str = "plugin:activated";
    pub const PLUGIN_DEACTIVATED: &str = "plugin:deactivated";
    pub const PLUGIN_ERROR: &str = "plugin:error";
    pub const PLUGIN_CONFIG_CHANGED: &str = "plugin:configChanged";
    pub const PLUGIN_STATE_CHANGED: &str = "plugin:state-changed";
    pub const PLUGIN_INSTALLED: &str = "plugin:installed";
    pub const PLUGIN_UNINSTALLED: &str = "plugin:uninstalled";

    pub const ALL: [&str; 13] = [
        APP_READY,
        APP_BEFORE_QUIT,
        WINDOW_CREATED,
        WINDOW_CLOSED,
        PLUGIN_LOADED,
        PLUGIN_INITIALIZED,
        PLUGIN_ACTIVATED,
        PLUGIN_DEACTIVATED,
        PLUGIN_ERROR,
        PLUGIN_CONFIG_CHANGED,
        PLUGIN_STATE_CHANGED,
        PLUGIN_INSTALLED,
        PLUGIN_UNINSTALLED,
    ];
}

/// Who owns a topic, from the point of view of one plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    /// Host or plugin-manager topic; plugins may listen but not publish
    System,
    /// The plugin's own `plugin:<id>:` namespace on the shared bus
    Shared,
    /// Local to the plugin, never forwarded
    Private,
}

/// Classify `topic` relative to `plugin_id`
pub fn classify(topic: &str, plugin_id: &str) -> EventScope {
    if HOST_PREFIXES.iter().any(|prefix| topic.starts_with(prefix)) {
        return EventScope::System;
    }

    if let Some(rest) = topic.strip_prefix(PLUGIN_PREFIX) {
        let own = rest
            .strip_prefix(plugin_id)
            .is_some_and(|tail| tail.starts_with(':'));
        return if own {
            EventScope::Shared
        } else {
            EventScope::System
        };
    }

    EventScope::Private
}

/// Topic inside a plugin's own namespace
pub fn plugin_topic(plugin_id: &str, name: &str) -> String {
    format!("{PLUGIN_PREFIX}{plugin_id}:{name}")
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginEvent {
    pub topic: String,
    /// Emitting plugin, `None` for the host
    pub source: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl PluginEvent {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            source: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn from_plugin(plugin_id: &str, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            source: Some(plugin_id.to_string()),
            ..Self::new(topic, payload)
        }
    }
}

pub type Listener = Arc<dyn Fn(&PluginEvent) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`Listener`]
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&PluginEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    once: bool,
    listener: Listener,
}

/// Topic-keyed listener registry
///
/// Delivery follows registration order. Listeners run outside the registry
/// lock, so they may subscribe or unsubscribe re-entrantly.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topics())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, topic: impl Into<String>, listener: Listener) -> SubscriptionId {
        self.subscribe(topic.into(), listener, false)
    }

    pub fn once(&self, topic: impl Into<String>, listener: Listener) -> SubscriptionId {
        self.subscribe(topic.into(), listener, true)
    }

    pub fn off(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut listeners = self.write();
        let Some(subs) = listeners.get_mut(topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            listeners.remove(topic);
        }
        removed
    }

    /// Drop every listener registered for `topic`
    pub fn off_all(&self, topic: &str) -> usize {
        self.write().remove(topic).map(|subs| subs.len()).unwrap_or(0)
    }

    /// Deliver to every listener, logging and skipping failures
    pub fn emit(&self, event: &PluginEvent) -> usize {
        let subs = self.take_for_delivery(&event.topic);
        let mut delivered = 0;
        for sub in subs {
            match (sub.listener)(event) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    topic = %event.topic,
                    subscription = %sub.id,
                    error = %e,
                    "Event listener failed"
                ),
            }
        }
        debug!(topic = %event.topic, delivered, "Event emitted");
        delivered
    }

    /// Deliver in order, stopping at and returning the first listener failure
    pub fn try_emit(&self, event: &PluginEvent) -> anyhow::Result<usize> {
        let subs = self.take_for_delivery(&event.topic);
        for (delivered, sub) in subs.iter().enumerate() {
            if let Err(e) = (sub.listener)(event) {
                warn!(topic = %event.topic, delivered, error = %e, "Event delivery aborted");
                return Err(e);
            }
        }
        Ok(subs.len())
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.read().get(topic).map(Vec::len).unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    fn subscribe(&self, topic: String, listener: Listener, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().entry(topic).or_default().push(Subscription {
            id,
            once,
            listener,
        });
        id
    }

    /// Snapshot listeners for `topic`, removing one-shot ones
    fn take_for_delivery(&self, topic: &str) -> Vec<Subscription> {
        let mut listeners = self.write();
        let Some(subs) = listeners.get_mut(topic) else {
            return Vec::new();
        };
        let snapshot = subs.clone();
        subs.retain(|s| !s.once);
        if subs.is_empty() {
            listeners.remove(topic);
        }
        snapshot
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<Subscription>>> {
        self.listeners.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<Subscription>>> {
        self.listeners.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Listener {
        let log = log.clone();
        let tag = tag.to_string();
        listener(move |event| {
            log.lock().unwrap().push(format!("{tag}:{}", event.topic));
            Ok(())
        })
    }

    fn failing() -> Listener {
        listener(|_| Err(anyhow::anyhow!("listener exploded")))
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("system:shutdown", "demo"), EventScope::System);
        assert_eq!(classify("app:ready", "demo"), EventScope::System);
        assert_eq!(classify("plugin:loaded", "demo"), EventScope::System);
        assert_eq!(classify("plugin:other:ping", "demo"), EventScope::System);
        assert_eq!(classify("plugin:demo:ping", "demo"), EventScope::Shared);
        assert_eq!(classify("plugin:demo-two:ping", "demo"), EventScope::System);
        assert_eq!(classify("refresh", "demo"), EventScope::Private);
        assert_eq!(plugin_topic("demo", "ping"), "plugin:demo:ping");
    }

    #[test]
    fn test_delivery_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("app:ready", recorder(&log, "a"));
        bus.on("app:ready", recorder(&log, "b"));

        assert_eq!(bus.emit(&PluginEvent::new("app:ready", json!(null))), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:app:ready", "b:app:ready"]);
    }

    #[test]
    fn test_emit_continues_past_failures() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("t", failing());
        bus.on("t", recorder(&log, "after"));

        assert_eq!(bus.emit(&PluginEvent::new("t", json!({}))), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_try_emit_stops_at_first_failure() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("t", recorder(&log, "before"));
        bus.on("t", failing());
        bus.on("t", recorder(&log, "after"));

        let err = bus.try_emit(&PluginEvent::new("t", json!({}))).unwrap_err();
        assert!(err.to_string().contains("exploded"));
        assert_eq!(*log.lock().unwrap(), vec!["before:t"]);
    }

    #[test]
    fn test_once_and_off() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.once("t", recorder(&log, "once"));
        let id = bus.on("t", recorder(&log, "on"));

        bus.emit(&PluginEvent::new("t", json!(1)));
        bus.emit(&PluginEvent::new("t", json!(2)));
        assert_eq!(log.lock().unwrap().len(), 3);

        assert!(bus.off("t", id));
        assert!(!bus.off("t", id));
        assert_eq!(bus.listener_count("t"), 0);
        assert!(bus.topics().is_empty());
    }

    #[test]
    fn test_listener_may_subscribe_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.on(
            "outer",
            listener(move |_| {
                inner.on("inner", listener(|_| Ok(())));
                Ok(())
            }),
        );

        bus.emit(&PluginEvent::new("outer", json!(null)));
        assert_eq!(bus.listener_count("inner"), 1);
    }
}
