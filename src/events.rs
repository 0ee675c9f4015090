//! Event manager: ordered, weighted, interceptable pub/sub connecting the
//! subsystems, with permission-group scoping and a direct listener path for
//! the scheduler.

use crate::SYSTEM_GROUP;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Parameter map handed to every handler and listener of an event.
pub type EventParams = HashMap<String, serde_json::Value>;

/// Build an [`EventParams`] map from key/value pairs.
pub fn params<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> EventParams {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Outcome reported by one event handler.
#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub success: bool,
    pub continue_process: bool,
    pub message: Option<String>,
    pub handler_name: String,
}

impl HandlerResult {
    pub fn ok(handler_name: impl Into<String>) -> Self {
        Self {
            success: true,
            continue_process: true,
            message: None,
            handler_name: handler_name.into(),
        }
    }

    /// Successful result that stops iteration over later handlers.
    pub fn intercept(handler_name: impl Into<String>) -> Self {
        Self {
            continue_process: false,
            ..Self::ok(handler_name)
        }
    }

    pub fn failed(handler_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            continue_process: true,
            message: Some(message.into()),
            handler_name: handler_name.into(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// An event handler. Errors are captured as failed results; they never stop
/// dispatch.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, params: &EventParams) -> anyhow::Result<HandlerResult>;
}

/// Handler built from an async closure, for subscribers that don't warrant
/// a named type.
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(EventParams) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<HandlerResult>> + Send,
{
    pub fn new(name: impl Into<String>, func: F) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            func,
        })
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventParams) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<HandlerResult>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, params: &EventParams) -> anyhow::Result<HandlerResult> {
        (self.func)(params.clone()).await
    }
}

/// Synchronous callback invoked after handler dispatch. Listeners cannot
/// intercept; the scheduler uses this path for zero-latency event triggers.
pub type DirectListener = Arc<dyn Fn(&str, &EventParams) + Send + Sync>;

/// Aggregate outcome of one `trigger_event` call.
#[derive(Debug, Clone, Default)]
pub struct AggregatedResult {
    pub results: Vec<HandlerResult>,
    /// True when every executed handler reported success.
    pub success: bool,
    /// Index (into `results`) of the handler that stopped iteration.
    pub intercepted_by: Option<usize>,
}

impl AggregatedResult {
    fn from_results(results: Vec<HandlerResult>, intercepted_by: Option<usize>) -> Self {
        let success = results.iter().all(|result| result.success);
        Self {
            results,
            success,
            intercepted_by,
        }
    }
}

struct Subscription {
    id: u64,
    handler: Arc<dyn EventHandler>,
    weight: i32,
    intercept: bool,
    permission_group: String,
    plugin: Option<String>,
}

/// The pub/sub fabric. Subscriptions are guarded by a reader/writer lock;
/// dispatch snapshots the ordered handler list before any await.
pub struct EventManager {
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    listeners: RwLock<HashMap<String, Vec<(u64, DirectListener)>>>,
    next_id: AtomicU64,
    events_triggered: AtomicU64,
}

impl EventManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events_triggered: AtomicU64::new(0),
        })
    }

    /// Subscribe a handler. Returns the subscription id used for removal.
    pub fn subscribe(
        &self,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
        weight: i32,
        intercept: bool,
        permission_group: &str,
    ) -> u64 {
        self.subscribe_for_plugin(event_name, handler, weight, intercept, permission_group, None)
    }

    pub fn subscribe_for_plugin(
        &self,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
        weight: i32,
        intercept: bool,
        permission_group: &str,
        plugin: Option<String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscriptions = self.subscriptions.write().expect("event manager poisoned");
        subscriptions
            .entry(event_name.to_string())
            .or_default()
            .push(Subscription {
                id,
                handler,
                weight,
                intercept,
                permission_group: permission_group.to_string(),
                plugin,
            });
        id
    }

    pub fn unsubscribe(&self, event_name: &str, id: u64) -> bool {
        let mut subscriptions = self.subscriptions.write().expect("event manager poisoned");
        if let Some(entries) = subscriptions.get_mut(event_name) {
            let before = entries.len();
            entries.retain(|sub| sub.id != id);
            return entries.len() != before;
        }
        false
    }

    /// Drop every subscription a plugin registered, across all events.
    pub fn unsubscribe_plugin(&self, plugin: &str) -> usize {
        let mut subscriptions = self.subscriptions.write().expect("event manager poisoned");
        let mut removed = 0;
        for entries in subscriptions.values_mut() {
            let before = entries.len();
            entries.retain(|sub| sub.plugin.as_deref() != Some(plugin));
            removed += before - entries.len();
        }
        removed
    }

    /// Register a direct listener invoked after every dispatch of the event.
    pub fn register_direct_listener(&self, event_name: &str, listener: DirectListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .expect("event manager poisoned")
            .entry(event_name.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    pub fn unregister_direct_listener(&self, event_name: &str, id: u64) -> bool {
        let mut listeners = self.listeners.write().expect("event manager poisoned");
        if let Some(entries) = listeners.get_mut(event_name) {
            let before = entries.len();
            entries.retain(|(listener_id, _)| *listener_id != id);
            if entries.is_empty() {
                listeners.remove(event_name);
                return before > 0;
            }
            return entries.len() != before;
        }
        false
    }

    /// Dispatch an event to subscribed handlers in weight order (ties by
    /// subscription order), then invoke direct listeners.
    ///
    /// Handlers whose permission group matches neither `permission_group`
    /// nor `SYSTEM` are skipped. A handler returning
    /// `continue_process = false` stops iteration; listeners still run.
    pub async fn trigger_event(
        &self,
        event_name: &str,
        permission_group: &str,
        params: EventParams,
    ) -> AggregatedResult {
        self.events_triggered.fetch_add(1, Ordering::Relaxed);

        // Snapshot matching handlers before awaiting anything.
        let handlers: Vec<(Arc<dyn EventHandler>, bool)> = {
            let subscriptions = self.subscriptions.read().expect("event manager poisoned");
            match subscriptions.get(event_name) {
                Some(entries) => {
                    let mut matching: Vec<&Subscription> = entries
                        .iter()
                        .filter(|sub| {
                            permission_group == SYSTEM_GROUP
                                || sub.permission_group == SYSTEM_GROUP
                                || sub.permission_group == permission_group
                        })
                        .collect();
                    // Stable sort keeps subscription order within a weight.
                    matching.sort_by_key(|sub| std::cmp::Reverse(sub.weight));
                    matching
                        .into_iter()
                        .map(|sub| (sub.handler.clone(), sub.intercept))
                        .collect()
                }
                None => Vec::new(),
            }
        };

        let mut results = Vec::with_capacity(handlers.len());
        let mut intercepted_by = None;

        for (handler, declared_intercept) in handlers {
            let result = match handler.handle(&params).await {
                Ok(result) => result,
                Err(error) => {
                    tracing::warn!(
                        event = event_name,
                        handler = handler.name(),
                        %error,
                        "event handler failed"
                    );
                    HandlerResult::failed(handler.name(), error.to_string())
                }
            };

            let stop = !result.continue_process;
            if stop && !declared_intercept {
                tracing::debug!(
                    event = event_name,
                    handler = %result.handler_name,
                    "handler without intercept flag stopped dispatch"
                );
            }
            results.push(result);
            if stop {
                intercepted_by = Some(results.len() - 1);
                break;
            }
        }

        // Direct listeners run regardless of interception and cannot stop
        // anything.
        let listeners: Vec<DirectListener> = {
            let listeners = self.listeners.read().expect("event manager poisoned");
            listeners
                .get(event_name)
                .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };
        for listener in listeners {
            listener(event_name, &params);
        }

        AggregatedResult::from_results(results, intercepted_by)
    }

    pub fn events_triggered(&self) -> u64 {
        self.events_triggered.load(Ordering::Relaxed)
    }

    /// Number of handler subscriptions for an event.
    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.subscriptions
            .read()
            .expect("event manager poisoned")
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Number of direct listeners for an event.
    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners
            .read()
            .expect("event manager poisoned")
            .get(event_name)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_handler(
        name: &str,
        log: Arc<Mutex<Vec<String>>>,
        result: HandlerResult,
    ) -> Arc<dyn EventHandler> {
        let owned = name.to_string();
        FnHandler::new(name, move |_params| {
            let log = log.clone();
            let owned = owned.clone();
            let result = result.clone();
            async move {
                log.lock().unwrap().push(owned);
                Ok(result)
            }
        })
    }

    #[tokio::test]
    async fn dispatch_orders_by_weight_then_subscription() {
        let manager = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        manager.subscribe(
            "e",
            recording_handler("low", log.clone(), HandlerResult::ok("low")),
            1,
            false,
            SYSTEM_GROUP,
        );
        manager.subscribe(
            "e",
            recording_handler("high", log.clone(), HandlerResult::ok("high")),
            10,
            false,
            SYSTEM_GROUP,
        );
        manager.subscribe(
            "e",
            recording_handler("high2", log.clone(), HandlerResult::ok("high2")),
            10,
            false,
            SYSTEM_GROUP,
        );

        let aggregated = manager.trigger_event("e", SYSTEM_GROUP, EventParams::new()).await;
        assert!(aggregated.success);
        assert_eq!(*log.lock().unwrap(), vec!["high", "high2", "low"]);
    }

    #[tokio::test]
    async fn interception_stops_later_handlers() {
        let manager = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        manager.subscribe(
            "e",
            recording_handler("first", log.clone(), HandlerResult::intercept("first")),
            5,
            true,
            SYSTEM_GROUP,
        );
        manager.subscribe(
            "e",
            recording_handler("second", log.clone(), HandlerResult::ok("second")),
            1,
            false,
            SYSTEM_GROUP,
        );

        let aggregated = manager.trigger_event("e", SYSTEM_GROUP, EventParams::new()).await;
        assert_eq!(aggregated.intercepted_by, Some(0));
        assert_eq!(aggregated.results.len(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn handler_error_is_captured_not_fatal() {
        let manager = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        manager.subscribe(
            "e",
            FnHandler::new("boom", |_params| async {
                anyhow::bail!("broken handler")
            }),
            10,
            false,
            SYSTEM_GROUP,
        );
        manager.subscribe(
            "e",
            recording_handler("after", log.clone(), HandlerResult::ok("after")),
            1,
            false,
            SYSTEM_GROUP,
        );

        let aggregated = manager.trigger_event("e", SYSTEM_GROUP, EventParams::new()).await;
        assert!(!aggregated.success);
        assert!(aggregated.intercepted_by.is_none());
        assert_eq!(aggregated.results.len(), 2);
        assert!(!aggregated.results[0].success);
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn permission_group_scopes_handlers() {
        let manager = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        manager.subscribe(
            "e",
            recording_handler("admin", log.clone(), HandlerResult::ok("admin")),
            1,
            false,
            "admin",
        );
        manager.subscribe(
            "e",
            recording_handler("system", log.clone(), HandlerResult::ok("system")),
            1,
            false,
            SYSTEM_GROUP,
        );

        // Non-system trigger: only matching group and SYSTEM handlers run.
        manager.trigger_event("e", "user", EventParams::new()).await;
        assert_eq!(*log.lock().unwrap(), vec!["system"]);

        log.lock().unwrap().clear();
        // System trigger matches everything.
        manager.trigger_event("e", SYSTEM_GROUP, EventParams::new()).await;
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn direct_listeners_run_even_when_intercepted() {
        let manager = EventManager::new();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));

        manager.subscribe(
            "e",
            FnHandler::new("stop", |_p| async { Ok(HandlerResult::intercept("stop")) }),
            1,
            true,
            SYSTEM_GROUP,
        );

        let seen_clone = seen.clone();
        let id = manager.register_direct_listener(
            "e",
            Arc::new(move |event, _params| {
                seen_clone.lock().unwrap().push(event.to_string());
            }),
        );

        manager.trigger_event("e", SYSTEM_GROUP, EventParams::new()).await;
        assert_eq!(*seen.lock().unwrap(), vec!["e"]);

        assert!(manager.unregister_direct_listener("e", id));
        assert_eq!(manager.listener_count("e"), 0);
        manager.trigger_event("e", SYSTEM_GROUP, EventParams::new()).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_plugin_drops_all_its_handlers() {
        let manager = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        manager.subscribe_for_plugin(
            "e",
            recording_handler("mine", log.clone(), HandlerResult::ok("mine")),
            1,
            false,
            SYSTEM_GROUP,
            Some("demo".into()),
        );
        manager.subscribe(
            "e",
            recording_handler("keep", log.clone(), HandlerResult::ok("keep")),
            1,
            false,
            SYSTEM_GROUP,
        );

        assert_eq!(manager.unsubscribe_plugin("demo"), 1);
        manager.trigger_event("e", SYSTEM_GROUP, EventParams::new()).await;
        assert_eq!(*log.lock().unwrap(), vec!["keep"]);
    }
}
