//! HTTP adapter endpoint: `POST /adapter/messages` accepts an envelope
//! batch and returns per-item acceptance results.

use crate::bus::runtime::MessageRuntime;
use crate::envelope;
use crate::error::Result;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;

/// Build the adapter router.
pub fn adapter_router(runtime: Arc<MessageRuntime>) -> Router {
    Router::new()
        .route("/adapter/messages", post(post_messages))
        .with_state(runtime)
}

/// Bind and serve the adapter endpoint until the task is aborted.
pub async fn serve(runtime: Arc<MessageRuntime>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind, "adapter HTTP endpoint listening");
    axum::serve(listener, adapter_router(runtime))
        .await
        .map_err(|error| anyhow::anyhow!("adapter HTTP server failed: {error}"))?;
    Ok(())
}

async fn post_messages(
    State(runtime): State<Arc<MessageRuntime>>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let schema_version = body
        .get("schema_version")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(u64::from(envelope::SCHEMA_VERSION));

    let items = match body.get("items").and_then(serde_json::Value::as_array) {
        Some(items) => items.clone(),
        None => {
            runtime.note_bad_envelope();
            return Json(serde_json::json!({
                "schema_version": schema_version,
                "error": "missing items array",
                "items": [],
            }));
        }
    };

    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let result = match envelope::decode_value(item) {
            Ok(envelope) => match runtime.push_incoming(envelope) {
                Ok(()) => serde_json::json!({"accepted": true}),
                Err(error) => serde_json::json!({"accepted": false, "error": error.to_string()}),
            },
            Err(error) => {
                runtime.note_bad_envelope();
                serde_json::json!({"accepted": false, "error": error.to_string()})
            }
        };
        results.push(result);
    }

    Json(serde_json::json!({
        "schema_version": schema_version,
        "items": results,
    }))
}
