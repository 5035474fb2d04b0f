//! Event access for a single plugin
//!
//! Topics are scoped with [`classify`]: host and foreign plugin topics can
//! be listened to but never published, the plugin's own `plugin:<id>:`
//! namespace goes through the shared bus, and anything else stays inside
//! the plugin. Shared-bus access requires `events:subscribe`, re-checked on
//! every delivery so revocation silences existing listeners.

use crate::error::{PluginError, PluginResult};
use crate::events::{self, EventBus, EventScope, Listener, PluginEvent, SubscriptionId, classify};
use crate::permission::{Permission, PermissionSet};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Events buffered for guest polling before the oldest are dropped
const INBOX_CAPACITY: usize = 256;

pub struct PluginEventApi {
    plugin_id: String,
    permissions: PermissionSet,
    bus: Arc<EventBus>,
    local: EventBus,
    bus_subscriptions: Mutex<Vec<(String, SubscriptionId)>>,
    inbox: Arc<Mutex<VecDeque<PluginEvent>>>,
    inbox_subscriptions: Mutex<Vec<(String, SubscriptionId)>>,
}

impl PluginEventApi {
    pub(crate) fn new(plugin_id: &str, permissions: PermissionSet, bus: Arc<EventBus>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            permissions,
            bus,
            local: EventBus::new(),
            bus_subscriptions: Mutex::new(Vec::new()),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            inbox_subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn scope(&self, topic: &str) -> EventScope {
        classify(topic, &self.plugin_id)
    }

    pub fn on(&self, topic: &str, listener: Listener) -> PluginResult<SubscriptionId> {
        self.subscribe(topic, listener, false)
    }

    pub fn once(&self, topic: &str, listener: Listener) -> PluginResult<SubscriptionId> {
        self.subscribe(topic, listener, true)
    }

    pub fn off(&self, topic: &str, id: SubscriptionId) -> bool {
        if self.scope(topic) == EventScope::Private {
            return self.local.off(topic, id);
        }

        let mut subs = lock(&self.bus_subscriptions);
        let Some(index) = subs.iter().position(|(t, s)| t == topic && *s == id) else {
            return false;
        };
        subs.remove(index);
        self.bus.off(topic, id)
    }

    /// Publish `payload`; returns how many listeners received it
    pub fn emit(&self, topic: &str, payload: Value) -> PluginResult<usize> {
        let event = PluginEvent::from_plugin(&self.plugin_id, topic, payload);
        match self.scope(topic) {
            EventScope::System => {
                warn!(plugin_id = %self.plugin_id, topic, "Plugin tried to emit a reserved event");
                Err(PluginError::ReservedEvent(topic.to_string()))
            }
            EventScope::Shared => {
                self.permissions
                    .require(&self.plugin_id, Permission::EventsSubscribe)?;
                Ok(self.bus.emit(&event))
            }
            EventScope::Private => Ok(self.local.emit(&event)),
        }
    }

    /// Buffer deliveries on `topic` for [`Self::drain_inbox`]
    pub fn subscribe_inbox(&self, topic: &str) -> PluginResult<SubscriptionId> {
        let inbox = Arc::clone(&self.inbox);
        let id = self.on(
            topic,
            events::listener(move |event| {
                let mut inbox = lock(&inbox);
                if inbox.len() == INBOX_CAPACITY {
                    inbox.pop_front();
                }
                inbox.push_back(event.clone());
                Ok(())
            }),
        )?;
        lock(&self.inbox_subscriptions).push((topic.to_string(), id));
        Ok(id)
    }

    /// Stop buffering `topic`; returns how many inbox subscriptions ended
    pub fn unsubscribe_inbox(&self, topic: &str) -> usize {
        let ended = {
            let mut subs = lock(&self.inbox_subscriptions);
            let (ended, kept): (Vec<_>, Vec<_>) = subs.drain(..).partition(|(t, _)| t == topic);
            *subs = kept;
            ended
        };
        ended.iter().filter(|(t, id)| self.off(t, *id)).count()
    }

    pub fn drain_inbox(&self) -> Vec<PluginEvent> {
        lock(&self.inbox).drain(..).collect()
    }

    /// Drop every shared-bus subscription this plugin made
    pub fn dispose(&self) -> usize {
        let subs: Vec<_> = lock(&self.bus_subscriptions).drain(..).collect();
        let removed = subs
            .iter()
            .filter(|(topic, id)| self.bus.off(topic, *id))
            .count();
        debug!(plugin_id = %self.plugin_id, removed, "Disposed plugin event subscriptions");
        removed
    }

    fn subscribe(&self, topic: &str, listener: Listener, once: bool) -> PluginResult<SubscriptionId> {
        if self.scope(topic) == EventScope::Private {
            return Ok(if once {
                self.local.once(topic, listener)
            } else {
                self.local.on(topic, listener)
            });
        }

        self.permissions
            .require(&self.plugin_id, Permission::EventsSubscribe)?;

        let gated = self.gate(listener);
        let id = if once {
            self.bus.once(topic, gated)
        } else {
            self.bus.on(topic, gated)
        };
        lock(&self.bus_subscriptions).push((topic.to_string(), id));
        Ok(id)
    }

    fn gate(&self, listener: Listener) -> Listener {
        let permissions = self.permissions.clone();
        let plugin_id = self.plugin_id.clone();
        events::listener(move |event| {
            if !permissions.contains(Permission::EventsSubscribe) {
                warn!(
                    plugin_id = %plugin_id,
                    topic = %event.topic,
                    "Dropping event for plugin without events:subscribe"
                );
                return Ok(());
            }
            listener(event)
        })
    }
}

impl Drop for PluginEventApi {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
