//! Unified scheduler: fires callbacks on time, event, or predicate
//! conditions with second-level resolution.
//!
//! A single cooperative tick loop runs on a fixed one-second cadence. EVENT
//! entries never poll: the scheduler registers one direct listener per
//! distinct event name with the event manager, and matching entries are
//! enqueued onto the scheduler worker the moment the event dispatches.

use crate::error::{Result, SchedulerError};
use crate::events::{EventManager, EventParams};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Tick cadence. Fixed by design; not a config knob.
pub const TICK: Duration = Duration::from_secs(1);

/// Trigger taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Time,
    Event,
    Custom,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Time => write!(f, "time"),
            TriggerKind::Event => write!(f, "event"),
            TriggerKind::Custom => write!(f, "custom"),
        }
    }
}

/// Predicate for CUSTOM triggers, polled once per tick. An error counts as
/// `false` for that tick.
pub type Predicate = Arc<dyn Fn() -> anyhow::Result<bool> + Send + Sync>;

/// Scheduled callback. Receives the entry's bound args, merged with event
/// params for EVENT triggers.
pub type TaskCallback =
    Arc<dyn Fn(EventParams) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure into a [`TaskCallback`].
pub fn callback<F, Fut>(func: F) -> TaskCallback
where
    F: Fn(EventParams) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(func(params)))
}

/// Trigger configuration supplied at creation.
#[derive(Clone)]
pub enum TriggerSpec {
    Time {
        /// Fire once this many seconds after creation.
        delay_secs: Option<u64>,
        /// Fire once at this absolute moment.
        trigger_at: Option<chrono::DateTime<chrono::Utc>>,
        /// Repeat cadence; required when recurring.
        interval_secs: Option<u64>,
    },
    Event { event_name: String },
    Custom { condition: Predicate },
}

impl TriggerSpec {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerSpec::Time { .. } => TriggerKind::Time,
            TriggerSpec::Event { .. } => TriggerKind::Event,
            TriggerSpec::Custom { .. } => TriggerKind::Custom,
        }
    }

    pub fn after_secs(delay_secs: u64) -> Self {
        TriggerSpec::Time {
            delay_secs: Some(delay_secs),
            trigger_at: None,
            interval_secs: None,
        }
    }

    pub fn at(trigger_at: chrono::DateTime<chrono::Utc>) -> Self {
        TriggerSpec::Time {
            delay_secs: None,
            trigger_at: Some(trigger_at),
            interval_secs: None,
        }
    }

    pub fn every_secs(interval_secs: u64) -> Self {
        TriggerSpec::Time {
            delay_secs: None,
            trigger_at: None,
            interval_secs: Some(interval_secs),
        }
    }

    pub fn on_event(event_name: impl Into<String>) -> Self {
        TriggerSpec::Event {
            event_name: event_name.into(),
        }
    }

    pub fn when<F>(condition: F) -> Self
    where
        F: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        TriggerSpec::Custom {
            condition: Arc::new(condition),
        }
    }
}

/// Creation request for one schedule entry.
#[derive(Clone)]
pub struct ScheduleRequest {
    pub name: String,
    pub trigger: TriggerSpec,
    pub recurring: bool,
    pub bound_args: EventParams,
}

impl ScheduleRequest {
    pub fn new(name: impl Into<String>, trigger: TriggerSpec) -> Self {
        Self {
            name: name.into(),
            trigger,
            recurring: false,
            bound_args: EventParams::new(),
        }
    }

    pub fn recurring(mut self) -> Self {
        self.recurring = true;
        self
    }

    pub fn with_args(mut self, args: EventParams) -> Self {
        self.bound_args = args;
        self
    }
}

struct ScheduleEntry {
    id: String,
    name: String,
    trigger: TriggerSpec,
    recurring: bool,
    active: bool,
    callback: TaskCallback,
    bound_args: EventParams,
    created_at: chrono::DateTime<chrono::Utc>,
    created_instant: Instant,
    last_triggered_at: Option<chrono::DateTime<chrono::Utc>>,
    last_fired_instant: Option<Instant>,
    trigger_count: u64,
    seq: u64,
}

impl ScheduleEntry {
    /// Whether a TIME trigger is due at `now`. EVENT entries are passive;
    /// CUSTOM entries are evaluated by the tick loop separately.
    fn time_due(&self, now: Instant, wall_now: chrono::DateTime<chrono::Utc>) -> bool {
        let TriggerSpec::Time {
            delay_secs,
            trigger_at,
            interval_secs,
        } = &self.trigger
        else {
            return false;
        };

        match self.last_fired_instant {
            None => {
                if let Some(at) = trigger_at {
                    return wall_now >= *at;
                }
                if let Some(delay) = delay_secs {
                    return now.duration_since(self.created_instant)
                        >= Duration::from_secs(*delay);
                }
                if let (true, Some(interval)) = (self.recurring, interval_secs) {
                    return now.duration_since(self.created_instant)
                        >= Duration::from_secs(*interval);
                }
                false
            }
            Some(last) => match (self.recurring, interval_secs) {
                (true, Some(interval)) => {
                    now.duration_since(last) >= Duration::from_secs(*interval)
                }
                _ => false,
            },
        }
    }

    fn info(&self) -> ScheduleInfo {
        ScheduleInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.trigger.kind(),
            event_name: match &self.trigger {
                TriggerSpec::Event { event_name } => Some(event_name.clone()),
                _ => None,
            },
            recurring: self.recurring,
            active: self.active,
            created_at: self.created_at,
            last_triggered_at: self.last_triggered_at,
            trigger_count: self.trigger_count,
        }
    }
}

/// Read-only snapshot of one entry.
#[derive(Debug, Clone)]
pub struct ScheduleInfo {
    pub id: String,
    pub name: String,
    pub kind: TriggerKind,
    pub event_name: Option<String>,
    pub recurring: bool,
    pub active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_triggered_at: Option<chrono::DateTime<chrono::Utc>>,
    pub trigger_count: u64,
}

/// Aggregate counters exposed by `stats()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total: usize,
    pub active: usize,
    pub time_entries: usize,
    pub event_entries: usize,
    pub custom_entries: usize,
    pub total_fires: u64,
}

enum FireRequest {
    Event {
        event_name: String,
        params: EventParams,
    },
}

/// The task engine. Entry map behind a std mutex never held across awaits.
pub struct UnifiedScheduler {
    entries: Arc<Mutex<HashMap<String, ScheduleEntry>>>,
    events: Arc<EventManager>,
    /// event name → direct listener id at the event manager.
    event_listeners: Mutex<HashMap<String, u64>>,
    fire_tx: mpsc::UnboundedSender<FireRequest>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    seq: AtomicU64,
    total_fires: Arc<AtomicU64>,
}

impl UnifiedScheduler {
    /// Create the scheduler and start its tick loop and event worker.
    pub fn start(events: Arc<EventManager>) -> Arc<Self> {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();

        let scheduler = Arc::new(Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            events,
            event_listeners: Mutex::new(HashMap::new()),
            fire_tx,
            tasks: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            total_fires: Arc::new(AtomicU64::new(0)),
        });

        let tick_handle = tokio::spawn(Self::tick_loop(Arc::downgrade(&scheduler)));
        let worker_handle = tokio::spawn(Self::event_worker(Arc::downgrade(&scheduler), fire_rx));
        {
            let mut tasks = scheduler.tasks.lock().expect("scheduler poisoned");
            tasks.push(tick_handle);
            tasks.push(worker_handle);
        }

        scheduler
    }

    /// Register a new entry. Returns its id.
    pub fn create(&self, request: ScheduleRequest, callback: TaskCallback) -> Result<String> {
        if let TriggerSpec::Time {
            delay_secs,
            trigger_at,
            interval_secs,
        } = &request.trigger
        {
            if request.recurring && interval_secs.is_none() {
                return Err(SchedulerError::InvalidTrigger(
                    "recurring TIME trigger requires interval_secs".into(),
                )
                .into());
            }
            if !request.recurring
                && delay_secs.is_none()
                && trigger_at.is_none()
            {
                return Err(SchedulerError::InvalidTrigger(
                    "TIME trigger requires delay_secs or trigger_at".into(),
                )
                .into());
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let entry = ScheduleEntry {
            id: id.clone(),
            name: request.name,
            trigger: request.trigger.clone(),
            recurring: request.recurring,
            active: true,
            callback,
            bound_args: request.bound_args,
            created_at: chrono::Utc::now(),
            created_instant: Instant::now(),
            last_triggered_at: None,
            last_fired_instant: None,
            trigger_count: 0,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        if let TriggerSpec::Event { event_name } = &request.trigger {
            self.ensure_event_listener(event_name);
        }

        let name = entry.name.clone();
        self.entries
            .lock()
            .expect("scheduler poisoned")
            .insert(id.clone(), entry);

        tracing::debug!(entry_id = %id, entry_name = %name, "schedule entry created");
        Ok(id)
    }

    /// Remove an entry. In-flight callbacks are not interrupted.
    pub fn remove(&self, id: &str) -> bool {
        let removed_event = {
            let mut entries = self.entries.lock().expect("scheduler poisoned");
            match entries.remove(id) {
                Some(entry) => match &entry.trigger {
                    TriggerSpec::Event { event_name } => Some(event_name.clone()),
                    _ => None,
                },
                None => return false,
            }
        };

        if let Some(event_name) = removed_event {
            self.release_event_listener_if_unused(&event_name);
        }
        tracing::debug!(entry_id = %id, "schedule entry removed");
        true
    }

    pub fn pause(&self, id: &str) -> Result<()> {
        self.set_active(id, false)
    }

    pub fn resume(&self, id: &str) -> Result<()> {
        self.set_active(id, true)
    }

    fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let mut entries = self.entries.lock().expect("scheduler poisoned");
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| SchedulerError::EntryNotFound(id.to_string()))?;
        entry.active = active;
        Ok(())
    }

    /// Force an immediate fire regardless of the entry's trigger state. A
    /// paused entry fires once and stays paused; a non-recurring entry is
    /// consumed exactly as a natural fire would consume it.
    pub fn trigger_now(&self, id: &str) -> Result<()> {
        let fire = {
            let mut entries = self.entries.lock().expect("scheduler poisoned");
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| SchedulerError::EntryNotFound(id.to_string()))?;
            let fire = Self::mark_fired(entry, self.total_fires.as_ref());
            if !entry.recurring {
                entries.remove(id);
            }
            fire
        };

        // Listener bookkeeping for consumed event entries.
        if let Some(event_name) = &fire.event_name {
            if !fire.recurring {
                self.release_event_listener_if_unused(event_name);
            }
        }

        self.spawn_fire(fire, EventParams::new());
        Ok(())
    }

    pub fn info(&self, id: &str) -> Option<ScheduleInfo> {
        self.entries
            .lock()
            .expect("scheduler poisoned")
            .get(id)
            .map(ScheduleEntry::info)
    }

    /// Snapshot all entries, optionally filtered by trigger kind.
    pub fn list(&self, kind: Option<TriggerKind>) -> Vec<ScheduleInfo> {
        let entries = self.entries.lock().expect("scheduler poisoned");
        let mut infos: Vec<ScheduleInfo> = entries
            .values()
            .filter(|entry| kind.is_none_or(|k| entry.trigger.kind() == k))
            .map(ScheduleEntry::info)
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn stats(&self) -> SchedulerStats {
        let entries = self.entries.lock().expect("scheduler poisoned");
        let mut stats = SchedulerStats {
            total: entries.len(),
            total_fires: self.total_fires.load(Ordering::Relaxed),
            ..SchedulerStats::default()
        };
        for entry in entries.values() {
            if entry.active {
                stats.active += 1;
            }
            match entry.trigger.kind() {
                TriggerKind::Time => stats.time_entries += 1,
                TriggerKind::Event => stats.event_entries += 1,
                TriggerKind::Custom => stats.custom_entries += 1,
            }
        }
        stats
    }

    /// Stop the tick loop and event worker. Entries stay in the map; no
    /// further fires happen.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().expect("scheduler poisoned");
        for handle in tasks.drain(..) {
            handle.abort();
        }
        tracing::debug!("scheduler stopped");
    }

    fn ensure_event_listener(&self, event_name: &str) {
        let mut listeners = self.event_listeners.lock().expect("scheduler poisoned");
        if listeners.contains_key(event_name) {
            return;
        }

        let fire_tx = self.fire_tx.clone();
        let listener_id = self.events.register_direct_listener(
            event_name,
            Arc::new(move |event_name: &str, params: &EventParams| {
                // Enqueue onto the scheduler worker; never block dispatch.
                let _ = fire_tx.send(FireRequest::Event {
                    event_name: event_name.to_string(),
                    params: params.clone(),
                });
            }),
        );
        listeners.insert(event_name.to_string(), listener_id);
    }

    fn release_event_listener_if_unused(&self, event_name: &str) {
        let still_used = {
            let entries = self.entries.lock().expect("scheduler poisoned");
            entries.values().any(|entry| {
                matches!(&entry.trigger, TriggerSpec::Event { event_name: name } if name == event_name)
            })
        };
        if still_used {
            return;
        }

        let mut listeners = self.event_listeners.lock().expect("scheduler poisoned");
        if let Some(listener_id) = listeners.remove(event_name) {
            self.events.unregister_direct_listener(event_name, listener_id);
            tracing::debug!(event = event_name, "scheduler event listener released");
        }
    }

    /// Update fire bookkeeping and capture what's needed to run the callback
    /// outside the lock.
    fn mark_fired(entry: &mut ScheduleEntry, total_fires: &AtomicU64) -> PendingFire {
        entry.trigger_count += 1;
        entry.last_triggered_at = Some(chrono::Utc::now());
        entry.last_fired_instant = Some(Instant::now());
        total_fires.fetch_add(1, Ordering::Relaxed);

        PendingFire {
            id: entry.id.clone(),
            name: entry.name.clone(),
            callback: entry.callback.clone(),
            bound_args: entry.bound_args.clone(),
            recurring: entry.recurring,
            event_name: match &entry.trigger {
                TriggerSpec::Event { event_name } => Some(event_name.clone()),
                _ => None,
            },
        }
    }

    fn spawn_fire(&self, fire: PendingFire, extra_params: EventParams) {
        let mut params = fire.bound_args.clone();
        params.extend(extra_params);
        let id = fire.id.clone();
        let name = fire.name.clone();
        let callback = fire.callback.clone();
        tokio::spawn(async move {
            if let Err(error) = (callback)(params).await {
                tracing::error!(
                    entry_id = %id,
                    entry_name = %name,
                    %error,
                    "schedule callback failed"
                );
            }
        });
    }

    async fn tick_loop(scheduler: std::sync::Weak<Self>) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let Some(scheduler) = scheduler.upgrade() else {
                break;
            };
            scheduler.run_tick();
        }
    }

    /// One tick: snapshot active entries, evaluate TIME/CUSTOM triggers,
    /// fire eligible entries concurrently.
    fn run_tick(&self) {
        let now = Instant::now();
        let wall_now = chrono::Utc::now();

        // Snapshot predicates first so user code never runs under the lock.
        let candidates: Vec<(String, Option<Predicate>)> = {
            let entries = self.entries.lock().expect("scheduler poisoned");
            entries
                .values()
                .filter(|entry| entry.active)
                .filter_map(|entry| match &entry.trigger {
                    TriggerSpec::Time { .. } => entry
                        .time_due(now, wall_now)
                        .then(|| (entry.id.clone(), None)),
                    TriggerSpec::Custom { condition } => {
                        Some((entry.id.clone(), Some(condition.clone())))
                    }
                    TriggerSpec::Event { .. } => None,
                })
                .collect()
        };

        let mut due = Vec::new();
        for (id, predicate) in candidates {
            match predicate {
                None => due.push(id),
                Some(condition) => match condition() {
                    Ok(true) => due.push(id),
                    Ok(false) => {}
                    Err(error) => {
                        tracing::warn!(entry_id = %id, %error, "schedule predicate failed; treating as false");
                    }
                },
            }
        }

        let fires: Vec<PendingFire> = {
            let mut entries = self.entries.lock().expect("scheduler poisoned");
            due.iter()
                .filter_map(|id| {
                    let entry = entries.get_mut(id)?;
                    if !entry.active {
                        return None;
                    }
                    let fire = Self::mark_fired(entry, self.total_fires.as_ref());
                    if !entry.recurring {
                        entries.remove(id);
                    }
                    Some(fire)
                })
                .collect()
        };

        for fire in fires {
            self.spawn_fire(fire, EventParams::new());
        }
    }

    async fn event_worker(
        scheduler: std::sync::Weak<Self>,
        mut fire_rx: mpsc::UnboundedReceiver<FireRequest>,
    ) {
        while let Some(request) = fire_rx.recv().await {
            let Some(scheduler) = scheduler.upgrade() else {
                break;
            };
            match request {
                FireRequest::Event { event_name, params } => {
                    scheduler.fire_event_entries(&event_name, params);
                }
            }
        }
    }

    /// Fire every active EVENT entry matching the name, in registration
    /// order, merging the event's params over the entry's bound args.
    fn fire_event_entries(&self, event_name: &str, params: EventParams) {
        let fires: Vec<PendingFire> = {
            let mut entries = self.entries.lock().expect("scheduler poisoned");
            let mut matching: Vec<&mut ScheduleEntry> = entries
                .values_mut()
                .filter(|entry| {
                    entry.active
                        && matches!(&entry.trigger, TriggerSpec::Event { event_name: name } if name == event_name)
                })
                .collect();
            matching.sort_by_key(|entry| entry.seq);

            let mut fires = Vec::with_capacity(matching.len());
            let mut consumed = Vec::new();
            for entry in matching {
                let fire = Self::mark_fired(entry, self.total_fires.as_ref());
                if !entry.recurring {
                    consumed.push(entry.id.clone());
                }
                fires.push(fire);
            }
            for id in consumed {
                entries.remove(&id);
            }
            fires
        };

        let mut release = Vec::new();
        for fire in &fires {
            if !fire.recurring {
                if let Some(event_name) = &fire.event_name {
                    release.push(event_name.clone());
                }
            }
        }
        for event_name in release {
            self.release_event_listener_if_unused(&event_name);
        }

        for fire in fires {
            self.spawn_fire(fire, params.clone());
        }
    }
}

struct PendingFire {
    id: String,
    name: String,
    callback: TaskCallback,
    bound_args: EventParams,
    recurring: bool,
    event_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SYSTEM_GROUP;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: Arc<AtomicUsize>) -> TaskCallback {
        callback(move |_params| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    async fn settle() {
        // Let spawned fire tasks run.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delay_entry_fires_once_and_is_removed(){
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events);
        let counter = Arc::new(AtomicUsize::new(0));

        let id = scheduler
            .create(
                ScheduleRequest::new("once", TriggerSpec::after_secs(2)),
                counting_callback(counter.clone()),
            )
            .unwrap();

        tokio::time::advance(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(scheduler.info(&id).is_none());

        // No further fires.
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_interval_fires_repeatedly() {
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events);
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .create(
                ScheduleRequest::new("pulse", TriggerSpec::every_secs(2)).recurring(),
                counting_callback(counter.clone()),
            )
            .unwrap();

        tokio::time::advance(Duration::from_millis(6_500)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn custom_predicate_gates_firing() {
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events);
        let counter = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let gate_clone = gate.clone();
        scheduler
            .create(
                ScheduleRequest::new(
                    "gated",
                    TriggerSpec::when(move || Ok(gate_clone.load(Ordering::SeqCst))),
                ),
                counting_callback(counter.clone()),
            )
            .unwrap();

        tokio::time::advance(Duration::from_millis(2_500)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        gate.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_error_counts_as_false() {
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events);
        let counter = Arc::new(AtomicUsize::new(0));

        let id = scheduler
            .create(
                ScheduleRequest::new("broken", TriggerSpec::when(|| anyhow::bail!("nope")))
                    .recurring(),
                counting_callback(counter.clone()),
            )
            .unwrap();

        tokio::time::advance(Duration::from_millis(3_500)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        // Entry survives predicate failures.
        assert!(scheduler.info(&id).is_some());
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn event_entry_fires_exactly_once_per_trigger() {
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .create(
                ScheduleRequest::new("on-event", TriggerSpec::on_event("ping")).recurring(),
                counting_callback(counter.clone()),
            )
            .unwrap();

        assert_eq!(events.listener_count("ping"), 1);

        events
            .trigger_event("ping", SYSTEM_GROUP, EventParams::new())
            .await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        events
            .trigger_event("ping", SYSTEM_GROUP, EventParams::new())
            .await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn event_entries_fire_in_registration_order_with_params() {
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second"] {
            let order = order.clone();
            scheduler
                .create(
                    ScheduleRequest::new(label, TriggerSpec::on_event("ping")).recurring(),
                    callback(move |params| {
                        let order = order.clone();
                        let label = label.to_string();
                        async move {
                            let stream = params
                                .get("stream_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            order.lock().unwrap().push((label, stream));
                            Ok(())
                        }
                    }),
                )
                .unwrap();
        }

        // One listener for the distinct event, regardless of entry count.
        assert_eq!(events.listener_count("ping"), 1);

        events
            .trigger_event(
                "ping",
                SYSTEM_GROUP,
                crate::events::params([("stream_id", serde_json::json!("qq:private:42"))]),
            )
            .await;
        settle().await;

        let order = order.lock().unwrap();
        assert_eq!(order.len(), 2);
        assert_eq!(order[0], ("first".into(), "qq:private:42".into()));
        assert_eq!(order[1], ("second".into(), "qq:private:42".into()));
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn removing_last_event_entry_releases_listener() {
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let a = scheduler
            .create(
                ScheduleRequest::new("a", TriggerSpec::on_event("ping")).recurring(),
                counting_callback(counter.clone()),
            )
            .unwrap();
        let b = scheduler
            .create(
                ScheduleRequest::new("b", TriggerSpec::on_event("ping")).recurring(),
                counting_callback(counter.clone()),
            )
            .unwrap();

        assert_eq!(events.listener_count("ping"), 1);
        scheduler.remove(&a);
        assert_eq!(events.listener_count("ping"), 1);
        scheduler.remove(&b);
        assert_eq!(events.listener_count("ping"), 0);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn paused_entries_do_not_fire() {
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let id = scheduler
            .create(
                ScheduleRequest::new("pulse", TriggerSpec::every_secs(1)).recurring(),
                counting_callback(counter.clone()),
            )
            .unwrap();

        scheduler.pause(&id).unwrap();
        tokio::time::advance(Duration::from_millis(3_500)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        scheduler.resume(&id).unwrap();
        tokio::time::advance(Duration::from_millis(1_100)).await;
        settle().await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_now_fires_paused_entry_and_leaves_it_paused() {
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let id = scheduler
            .create(
                ScheduleRequest::new("pulse", TriggerSpec::every_secs(1)).recurring(),
                counting_callback(counter.clone()),
            )
            .unwrap();
        scheduler.pause(&id).unwrap();

        scheduler.trigger_now(&id).unwrap();
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let info = scheduler.info(&id).unwrap();
        assert!(!info.active);
        assert_eq!(info.trigger_count, 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_now_then_remove_matches_remove_alone() {
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let id = scheduler
            .create(
                ScheduleRequest::new("once", TriggerSpec::after_secs(30)),
                counting_callback(counter.clone()),
            )
            .unwrap();

        scheduler.trigger_now(&id).unwrap();
        settle().await;
        // Non-recurring: consumed by the forced fire.
        assert!(!scheduler.remove(&id));

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.stats().total, 0);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn stats_and_list_reflect_entries() {
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .create(
                ScheduleRequest::new("t", TriggerSpec::after_secs(60)),
                counting_callback(counter.clone()),
            )
            .unwrap();
        scheduler
            .create(
                ScheduleRequest::new("e", TriggerSpec::on_event("ping")).recurring(),
                counting_callback(counter.clone()),
            )
            .unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.time_entries, 1);
        assert_eq!(stats.event_entries, 1);
        assert_eq!(scheduler.list(Some(TriggerKind::Event)).len(), 1);
        assert_eq!(scheduler.list(None).len(), 2);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn invalid_time_trigger_is_rejected() {
        let events = EventManager::new();
        let scheduler = UnifiedScheduler::start(events.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        let error = scheduler
            .create(
                ScheduleRequest::new(
                    "bad",
                    TriggerSpec::Time {
                        delay_secs: None,
                        trigger_at: None,
                        interval_secs: None,
                    },
                ),
                counting_callback(counter.clone()),
            )
            .unwrap_err();
        assert!(error.to_string().contains("TIME trigger"));

        let error = scheduler
            .create(
                ScheduleRequest::new("bad2", TriggerSpec::after_secs(1)).recurring(),
                counting_callback(counter),
            )
            .unwrap_err();
        assert!(error.to_string().contains("interval_secs"));
        scheduler.shutdown();
    }
}
