//! Message runtime: inbound routing and outbound dispatch.
//!
//! Inbound envelopes land on a bounded queue, are fanned out to per-stream
//! workers (strict arrival order within a stream), and flow through
//! before-hooks, the first matching route, and after-hooks. Handler faults
//! are isolated per envelope; routing always continues.

use crate::config::RuntimeConfig;
use crate::envelope::{MessageEnvelope, MessageKind};
use crate::error::{BusError, Result, SkipMessage};
use crate::StreamId;
use async_trait::async_trait;
use futures::FutureExt as _;
use rand::Rng as _;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

use super::sink::AdapterSink;

/// Predicate deciding whether a route takes an envelope.
pub type RoutePredicate = Arc<dyn Fn(&MessageEnvelope) -> bool + Send + Sync>;

/// Before-hook: may veto an envelope by returning an error; a
/// [`SkipMessage`] error is an intentional, non-fault skip.
pub type BeforeHook = Arc<dyn Fn(&MessageEnvelope) -> anyhow::Result<()> + Send + Sync>;

/// After-hook, purely observational.
pub type AfterHook = Arc<dyn Fn(&MessageEnvelope) + Send + Sync>;

/// Error-hook observer, called after the runtime has classified the error.
pub type ErrorHook = Arc<dyn Fn(&MessageEnvelope, &anyhow::Error) + Send + Sync>;

/// Handler invoked for a routed envelope.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, envelope: MessageEnvelope) -> anyhow::Result<()>;
}

/// Route handler built from an async closure.
pub struct FnRouteHandler<F> {
    func: F,
}

impl<F, Fut> FnRouteHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(func: F) -> Arc<Self> {
        Arc::new(Self { func })
    }
}

#[async_trait]
impl<F, Fut> RouteHandler for FnRouteHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, envelope: MessageEnvelope) -> anyhow::Result<()> {
        (self.func)(envelope).await
    }
}

/// Route selection tier. Typed routes win over event routes, which win over
/// generic routes; within a tier, registration order decides.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Matches only envelopes of this message kind.
    Typed(MessageKind),
    /// Matches platform event envelopes (notice / meta).
    Event,
    /// Matches anything.
    Generic,
}

/// A registered route.
#[derive(Clone)]
pub struct Route {
    pub name: String,
    pub class: RouteClass,
    pub predicate: RoutePredicate,
    pub handler: Arc<dyn RouteHandler>,
}

impl Route {
    fn admits(&self, envelope: &MessageEnvelope) -> bool {
        let class_ok = match self.class {
            RouteClass::Typed(kind) => envelope.message_info.message_type == kind,
            RouteClass::Event => matches!(
                envelope.message_info.message_type,
                MessageKind::Notice | MessageKind::Meta
            ),
            RouteClass::Generic => true,
        };
        class_ok && (self.predicate)(envelope)
    }
}

struct Inner {
    routes: RwLock<Vec<Route>>,
    before_hooks: RwLock<Vec<BeforeHook>>,
    after_hooks: RwLock<Vec<AfterHook>>,
    error_hooks: RwLock<Vec<ErrorHook>>,
    sinks: RwLock<HashMap<String, Arc<dyn AdapterSink>>>,
    workers: Mutex<HashMap<StreamId, mpsc::UnboundedSender<MessageEnvelope>>>,
    inbound_tx: mpsc::Sender<MessageEnvelope>,
    accepting: AtomicBool,
    /// Envelopes enqueued but not yet fully processed.
    inflight: AtomicUsize,
    processed: AtomicU64,
    bad_envelopes: AtomicU64,
    skipped: AtomicU64,
    config: RuntimeConfig,
    shutdown_tx: watch::Sender<bool>,
}

/// The message bus runtime. Cheap to clone via `Arc`.
pub struct MessageRuntime {
    inner: Arc<Inner>,
}

impl MessageRuntime {
    /// Create the runtime and start its dispatcher task.
    pub fn start(config: RuntimeConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            routes: RwLock::new(Vec::new()),
            before_hooks: RwLock::new(Vec::new()),
            after_hooks: RwLock::new(Vec::new()),
            error_hooks: RwLock::new(Vec::new()),
            sinks: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            inbound_tx,
            accepting: AtomicBool::new(true),
            inflight: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            bad_envelopes: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            config,
            shutdown_tx,
        });

        tokio::spawn(Self::dispatcher(inner.clone(), inbound_rx, shutdown_rx));

        Arc::new(Self { inner })
    }

    /// Enqueue an inbound envelope for routing. Returns after the enqueue;
    /// never waits on handler work. A full queue yields
    /// [`BusError::BufferFull`]; adapters preferring to block use
    /// [`MessageRuntime::push_incoming_blocking`].
    pub fn push_incoming(&self, envelope: MessageEnvelope) -> Result<()> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(BusError::SendFailed("runtime is shutting down".into()).into());
        }
        self.inner.inflight.fetch_add(1, Ordering::AcqRel);
        match self.inner.inbound_tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.inflight.fetch_sub(1, Ordering::AcqRel);
                Err(BusError::BufferFull.into())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.inflight.fetch_sub(1, Ordering::AcqRel);
                Err(BusError::SendFailed("runtime is shutting down".into()).into())
            }
        }
    }

    /// Blocking variant for adapters whose backpressure policy is to wait
    /// instead of dropping.
    pub async fn push_incoming_blocking(&self, envelope: MessageEnvelope) -> Result<()> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(BusError::SendFailed("runtime is shutting down".into()).into());
        }
        self.inner.inflight.fetch_add(1, Ordering::AcqRel);
        self.inner.inbound_tx.send(envelope).await.map_err(|_| {
            self.inner.inflight.fetch_sub(1, Ordering::AcqRel);
            crate::Error::from(BusError::SendFailed("runtime is shutting down".into()))
        })
    }

    /// Hand an outgoing envelope to the adapter sink for its platform.
    /// Transient failures are retried with exponential backoff and jitter;
    /// other failures propagate to the caller.
    pub async fn send_outgoing(&self, envelope: &MessageEnvelope) -> Result<()> {
        let sink = self
            .sink_for(&envelope.platform)
            .ok_or_else(|| BusError::NoAdapterForPlatform(envelope.platform.clone()))?;

        let mut attempt = 0u32;
        loop {
            match sink.deliver(envelope).await {
                Ok(()) => return Ok(()),
                Err(crate::Error::Bus(error))
                    if error.is_transient() && attempt < self.inner.config.max_send_retries =>
                {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        platform = %envelope.platform,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient send failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Invoke a platform API through its sink (echo-correlated for framed
    /// adapters). Timeouts surface as [`BusError::AdapterTimeout`].
    pub async fn call_adapter_api(
        &self,
        platform: &str,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let sink = self
            .sink_for(platform)
            .ok_or_else(|| BusError::NoAdapterForPlatform(platform.to_string()))?;
        sink.call_api(action, params).await
    }

    pub fn register_sink(&self, sink: Arc<dyn AdapterSink>) {
        let platform = sink.platform().to_string();
        self.inner
            .sinks
            .write()
            .expect("runtime poisoned")
            .insert(platform.clone(), sink);
        tracing::info!(platform, "adapter sink registered");
    }

    fn sink_for(&self, platform: &str) -> Option<Arc<dyn AdapterSink>> {
        self.inner
            .sinks
            .read()
            .expect("runtime poisoned")
            .get(platform)
            .cloned()
    }

    /// Register a route. Priority is by [`RouteClass`] tier, then by
    /// registration order within the tier.
    pub fn add_route(
        &self,
        name: impl Into<String>,
        class: RouteClass,
        predicate: RoutePredicate,
        handler: Arc<dyn RouteHandler>,
    ) {
        self.inner
            .routes
            .write()
            .expect("runtime poisoned")
            .push(Route {
                name: name.into(),
                class,
                predicate,
                handler,
            });
    }

    pub fn register_before_hook(&self, hook: BeforeHook) {
        self.inner
            .before_hooks
            .write()
            .expect("runtime poisoned")
            .push(hook);
    }

    pub fn register_after_hook(&self, hook: AfterHook) {
        self.inner
            .after_hooks
            .write()
            .expect("runtime poisoned")
            .push(hook);
    }

    pub fn register_error_hook(&self, hook: ErrorHook) {
        self.inner
            .error_hooks
            .write()
            .expect("runtime poisoned")
            .push(hook);
    }

    /// Bump the bad-envelope counter (parse failures at the boundary).
    pub fn note_bad_envelope(&self) {
        self.inner.bad_envelopes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed_count(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    pub fn bad_envelope_count(&self) -> u64 {
        self.inner.bad_envelopes.load(Ordering::Relaxed)
    }

    pub fn skipped_count(&self) -> u64 {
        self.inner.skipped.load(Ordering::Relaxed)
    }

    /// Stop intake, drain in-flight envelopes up to the configured
    /// deadline, and stop the dispatcher and workers. Sinks stay open so
    /// later shutdown stages can still send.
    pub async fn quiesce(&self) {
        self.inner.accepting.store(false, Ordering::Release);

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.inner.config.drain_timeout_secs);
        while self.inner.inflight.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    remaining = self.inner.inflight.load(Ordering::Acquire),
                    "drain deadline reached with envelopes still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let _ = self.inner.shutdown_tx.send(true);
        self.inner
            .workers
            .lock()
            .expect("runtime poisoned")
            .clear();
        tracing::info!("message runtime quiesced");
    }

    /// Close every registered adapter sink.
    pub async fn close_sinks(&self) {
        let sinks: Vec<Arc<dyn AdapterSink>> = {
            let sinks = self.inner.sinks.read().expect("runtime poisoned");
            sinks.values().cloned().collect()
        };
        for sink in sinks {
            if let Err(error) = sink.close().await {
                tracing::warn!(platform = sink.platform(), %error, "sink close failed");
            }
        }
    }

    /// Full shutdown: quiesce, then close adapters.
    pub async fn shutdown(&self) {
        self.quiesce().await;
        self.close_sinks().await;
        tracing::info!("message runtime stopped");
    }

    async fn dispatcher(
        inner: Arc<Inner>,
        mut inbound_rx: mpsc::Receiver<MessageEnvelope>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let envelope = tokio::select! {
                _ = shutdown_rx.changed() => break,
                maybe = inbound_rx.recv() => match maybe {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let stream_id = envelope.stream_id();
            let worker_tx = {
                let mut workers = inner.workers.lock().expect("runtime poisoned");
                workers
                    .entry(stream_id.clone())
                    .or_insert_with(|| Self::spawn_stream_worker(inner.clone(), stream_id.clone()))
                    .clone()
            };

            if worker_tx.send(envelope).is_err() {
                // Worker died (shutdown); account for the dropped envelope.
                inner.inflight.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn spawn_stream_worker(
        inner: Arc<Inner>,
        stream_id: StreamId,
    ) -> mpsc::UnboundedSender<MessageEnvelope> {
        let (tx, mut rx) = mpsc::unbounded_channel::<MessageEnvelope>();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                Self::process_envelope(&inner, envelope).await;
                inner.inflight.fetch_sub(1, Ordering::AcqRel);
            }
            tracing::trace!(stream_id = %stream_id, "stream worker stopped");
        });
        tx
    }

    async fn process_envelope(inner: &Arc<Inner>, envelope: MessageEnvelope) {
        // Before-hooks, in registration order.
        let before: Vec<BeforeHook> = {
            let hooks = inner.before_hooks.read().expect("runtime poisoned");
            hooks.clone()
        };
        for hook in before {
            if let Err(error) = hook(&envelope) {
                Self::surface_error(inner, &envelope, error);
                return;
            }
        }

        // First matching route, by tier then registration order.
        let route = {
            let routes = inner.routes.read().expect("runtime poisoned");
            let tiers = [
                routes
                    .iter()
                    .find(|route| matches!(route.class, RouteClass::Typed(_)) && route.admits(&envelope)),
                routes
                    .iter()
                    .find(|route| route.class == RouteClass::Event && route.admits(&envelope)),
                routes
                    .iter()
                    .find(|route| route.class == RouteClass::Generic && route.admits(&envelope)),
            ];
            let first = tiers.into_iter().flatten().next().cloned();
            first
        };

        let Some(route) = route else {
            tracing::debug!(
                message_id = %envelope.message_id,
                kind = %envelope.message_info.message_type,
                "no route matched envelope"
            );
            return;
        };

        // Isolate panics as well as errors; a broken handler must never take
        // the worker down.
        let outcome = std::panic::AssertUnwindSafe(route.handler.handle(envelope.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                inner.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(error)) => Self::surface_error(inner, &envelope, error),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                Self::surface_error(
                    inner,
                    &envelope,
                    anyhow::anyhow!("route {} panicked: {reason}", route.name),
                );
            }
        }

        let after: Vec<AfterHook> = {
            let hooks = inner.after_hooks.read().expect("runtime poisoned");
            hooks.clone()
        };
        for hook in after {
            hook(&envelope);
        }
    }

    /// Classify and swallow a processing error so routing continues.
    fn surface_error(inner: &Arc<Inner>, envelope: &MessageEnvelope, error: anyhow::Error) {
        if error.is::<SkipMessage>() {
            inner.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::info!(message_id = %envelope.message_id, "envelope skipped by hook");
        } else {
            tracing::error!(
                message_id = %envelope.message_id,
                stream_id = %envelope.stream_id(),
                %error,
                "envelope processing failed"
            );
        }

        let hooks: Vec<ErrorHook> = {
            let hooks = inner.error_hooks.read().expect("runtime poisoned");
            hooks.clone()
        };
        for hook in hooks {
            hook(envelope, &error);
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.inner.config.retry_base_delay_ms;
        let cap = self.inner.config.retry_max_delay_ms;
        let exp = base.saturating_mul(1u64 << attempt.min(16)).min(cap);
        let jitter = rand::rng().random_range(0.5..1.5);
        Duration::from_millis((exp as f64 * jitter) as u64)
    }
}
