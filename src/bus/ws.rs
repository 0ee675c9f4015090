//! WebSocket adapter transport.
//!
//! Each accepted connection speaks [`WireFrame`](super::frame::WireFrame)s
//! as JSON text messages and is bridged onto a [`SubprocessSink`]: inbound
//! `message` frames feed the runtime, outbound envelopes and API calls are
//! written back, with `api_response` frames multiplexed by echo.

use crate::bus::runtime::MessageRuntime;
use crate::bus::sink::SubprocessSink;
use crate::error::Result;
use futures::{SinkExt as _, StreamExt as _};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;

/// Accept adapter connections for one platform until the task is aborted.
/// A reconnecting adapter replaces the platform's registered sink.
pub async fn serve(
    runtime: Arc<MessageRuntime>,
    bind: &str,
    platform: &str,
    api_timeout: Duration,
) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(bind, platform, "adapter WebSocket endpoint listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let runtime = runtime.clone();
        let platform = platform.to_string();
        tokio::spawn(async move {
            tracing::info!(%peer, platform, "adapter connected");
            if let Err(error) = handle_connection(runtime, socket, &platform, api_timeout).await {
                tracing::warn!(%peer, platform, %error, "adapter connection ended");
            }
        });
    }
}

async fn handle_connection(
    runtime: Arc<MessageRuntime>,
    socket: tokio::net::TcpStream,
    platform: &str,
    api_timeout: Duration,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(socket)
        .await
        .map_err(|error| anyhow::anyhow!("websocket handshake failed: {error}"))?;
    let (mut write, mut read) = ws.split();

    let (sink, mut frame_rx) = SubprocessSink::new(platform, api_timeout);
    runtime.register_sink(sink.clone());

    // Writer pump: outbound frames to the wire.
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(error) => {
                    tracing::warn!(%error, "dropping unencodable frame");
                    continue;
                }
            };
            if write.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader loop: wire frames into the sink.
    while let Some(message) = read.next().await {
        let message = match message {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(%error, "websocket read error");
                break;
            }
        };
        match message {
            Message::Text(text) => match super::frame::WireFrame::decode(text.as_str()) {
                Ok(frame) => sink.handle_frame(frame, &runtime).await,
                Err(error) => {
                    runtime.note_bad_envelope();
                    tracing::warn!(%error, "dropping malformed frame");
                }
            },
            Message::Close(_) => break,
            // Pings are answered by tungstenite; ignore the rest.
            _ => {}
        }
    }

    writer.abort();
    Ok(())
}
