//! Adapter sinks: the outbound half of the adapter boundary.
//!
//! Two sink kinds share one interface. [`InProcessSink`] hands envelopes to
//! an in-process adapter over a channel; [`SubprocessSink`] frames them over
//! a duplex channel and multiplexes API responses by echo.

use crate::envelope::{self, MessageEnvelope};
use crate::error::{BusError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Duration;

/// Outbound interface every adapter implements or is wrapped in.
#[async_trait]
pub trait AdapterSink: Send + Sync {
    /// Platform tag this sink serves (e.g. `qq`).
    fn platform(&self) -> &str;

    /// Hand an outgoing envelope to the adapter.
    async fn deliver(&self, envelope: &MessageEnvelope) -> Result<()>;

    /// Invoke a platform API and wait for the correlated response.
    async fn call_api(&self, action: &str, params: serde_json::Value) -> Result<serde_json::Value>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Handler an in-process adapter registers for API calls.
pub type ApiHandler =
    Arc<dyn Fn(&str, serde_json::Value) -> Result<serde_json::Value> + Send + Sync>;

/// Sink for adapters living in the same process: delivery is a channel
/// send, API calls go through a synchronous handler.
pub struct InProcessSink {
    platform: String,
    outbound_tx: mpsc::UnboundedSender<MessageEnvelope>,
    api_handler: Option<ApiHandler>,
}

impl InProcessSink {
    /// Returns the sink plus the receiver the adapter drains deliveries from.
    pub fn new(platform: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<MessageEnvelope>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                platform: platform.into(),
                outbound_tx,
                api_handler: None,
            }),
            outbound_rx,
        )
    }

    pub fn with_api_handler(
        platform: impl Into<String>,
        api_handler: ApiHandler,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MessageEnvelope>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                platform: platform.into(),
                outbound_tx,
                api_handler: Some(api_handler),
            }),
            outbound_rx,
        )
    }
}

#[async_trait]
impl AdapterSink for InProcessSink {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn deliver(&self, envelope: &MessageEnvelope) -> Result<()> {
        self.outbound_tx
            .send(envelope.clone())
            .map_err(|_| BusError::SendFailed(format!("{} adapter gone", self.platform)).into())
    }

    async fn call_api(&self, action: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        match &self.api_handler {
            Some(handler) => handler(action, params),
            None => Ok(serde_json::Value::Null),
        }
    }
}

/// Sink for adapters behind a duplex framed channel (subprocess stdio or a
/// WebSocket). Envelopes go out as `message` frames; API calls allocate an
/// echo, park a oneshot, and wait for the matching `api_response`.
pub struct SubprocessSink {
    platform: String,
    frame_tx: mpsc::Sender<WireFrameOut>,
    pending: Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>,
    api_timeout: Duration,
}

/// Frames written toward the adapter process.
pub type WireFrameOut = super::frame::WireFrame;

impl SubprocessSink {
    /// Returns the sink plus the receiver the transport pump drains frames
    /// from and writes to the wire.
    pub fn new(
        platform: impl Into<String>,
        api_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<WireFrameOut>) {
        let (frame_tx, frame_rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                platform: platform.into(),
                frame_tx,
                pending: Mutex::new(HashMap::new()),
                api_timeout,
            }),
            frame_rx,
        )
    }

    /// Feed one frame read from the wire. `message` frames are decoded and
    /// pushed into the runtime; `api_response` frames complete the parked
    /// call with the matching echo. Responses without a matching echo are
    /// dropped.
    pub async fn handle_frame(
        &self,
        frame: super::frame::WireFrame,
        runtime: &super::runtime::MessageRuntime,
    ) {
        use super::frame::FrameKind;

        match frame.kind {
            FrameKind::Message => match envelope::decode_value(frame.payload) {
                Ok(envelope) => {
                    if let Err(error) = runtime.push_incoming(envelope) {
                        tracing::warn!(platform = %self.platform, %error, "inbound envelope rejected");
                    }
                }
                Err(error) => {
                    runtime.note_bad_envelope();
                    tracing::warn!(platform = %self.platform, %error, "dropping bad envelope frame");
                }
            },
            FrameKind::ApiResponse => {
                let Some(echo) = frame.echo else {
                    tracing::debug!(platform = %self.platform, "api_response without echo dropped");
                    return;
                };
                let waiter = self.pending.lock().await.remove(&echo);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame.payload);
                    }
                    None => {
                        tracing::debug!(
                            platform = %self.platform,
                            echo,
                            "api_response with unknown echo dropped"
                        );
                    }
                }
            }
            FrameKind::ApiCall => {
                // The core never receives api_call frames; adapters do.
                tracing::debug!(platform = %self.platform, "unexpected api_call frame dropped");
            }
        }
    }
}

#[async_trait]
impl AdapterSink for SubprocessSink {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn deliver(&self, envelope: &MessageEnvelope) -> Result<()> {
        let payload = serde_json::to_value(envelope)
            .map_err(|error| BusError::BadEnvelope(format!("encode failed: {error}")))?;
        self.frame_tx
            .send(WireFrameOut::message(payload))
            .await
            .map_err(|_| {
                BusError::TransientAdapter(format!("{} adapter channel closed", self.platform))
                    .into()
            })
    }

    async fn call_api(&self, action: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let echo = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(echo.clone(), tx);

        let frame = WireFrameOut::api_call(action, params, echo.clone());
        if self.frame_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&echo);
            return Err(BusError::TransientAdapter(format!(
                "{} adapter channel closed",
                self.platform
            ))
            .into());
        }

        match tokio::time::timeout(self.api_timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            // Sender dropped without a response: treat like a timeout.
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().await.remove(&echo);
                Err(BusError::AdapterTimeout {
                    platform: self.platform.clone(),
                    action: action.to_string(),
                    waited_secs: self.api_timeout.as_secs(),
                }
                .into())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // Dropping parked waiters fails their calls promptly.
        self.pending.lock().await.clear();
        Ok(())
    }
}
