//! Chat streams: per-conversation context keyed by platform + party.
//!
//! A stream owns a bounded ring of recent messages, a prompt context cache,
//! and the last-activity stamp. Streams are created lazily on the first
//! envelope (or an explicit cold start) and destroyed only on platform
//! reset.

use crate::envelope::{MessageEnvelope, UserInfo};
use crate::error::Result;
use crate::StreamId;
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// One entry in a stream's recent window.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub message_id: String,
    pub sender: UserInfo,
    pub text: String,
    pub timestamp_ms: i64,
    pub outgoing: bool,
}

#[derive(Debug)]
struct StreamState {
    window: std::collections::VecDeque<StreamMessage>,
    capacity: usize,
    context_cache: Option<String>,
    last_activity_ms: i64,
    last_timestamp_ms: i64,
    message_count: u64,
}

/// A single conversation thread. The inner state is guarded by a per-stream
/// lock; the registry hands out `Arc<ChatStream>` for shared access.
#[derive(Debug)]
pub struct ChatStream {
    pub id: StreamId,
    pub platform: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    state: Mutex<StreamState>,
}

impl ChatStream {
    fn new(id: StreamId, platform: String, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            platform,
            created_at: chrono::Utc::now(),
            state: Mutex::new(StreamState {
                window: std::collections::VecDeque::with_capacity(capacity),
                capacity,
                context_cache: None,
                last_activity_ms: 0,
                last_timestamp_ms: 0,
                message_count: 0,
            }),
        })
    }

    /// Append an envelope to the recent window.
    ///
    /// Timestamps never decrease within a stream: a stamp older than the
    /// last recorded one is clamped forward.
    pub async fn record(&self, envelope: &MessageEnvelope) {
        let mut state = self.state.lock().await;

        let mut timestamp_ms = envelope.timestamp_ms;
        if timestamp_ms < state.last_timestamp_ms {
            tracing::debug!(
                stream_id = %self.id,
                envelope_ts = envelope.timestamp_ms,
                clamped_to = state.last_timestamp_ms,
                "clamping non-monotonic timestamp"
            );
            timestamp_ms = state.last_timestamp_ms;
        }
        state.last_timestamp_ms = timestamp_ms;
        state.last_activity_ms = chrono::Utc::now().timestamp_millis();
        state.message_count += 1;
        state.context_cache = None;

        let message = StreamMessage {
            message_id: envelope.message_id.clone(),
            sender: envelope.message_info.user.clone(),
            text: envelope.plain_text(),
            timestamp_ms,
            outgoing: !envelope.is_incoming(),
        };

        if state.window.len() == state.capacity {
            state.window.pop_front();
        }
        state.window.push_back(message);
    }

    /// The most recent `limit` messages, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<StreamMessage> {
        let state = self.state.lock().await;
        let skip = state.window.len().saturating_sub(limit);
        state.window.iter().skip(skip).cloned().collect()
    }

    pub async fn last_activity_ms(&self) -> i64 {
        self.state.lock().await.last_activity_ms
    }

    pub async fn message_count(&self) -> u64 {
        self.state.lock().await.message_count
    }

    /// Cached prompt context, if still valid.
    pub async fn cached_context(&self) -> Option<String> {
        self.state.lock().await.context_cache.clone()
    }

    pub async fn cache_context(&self, context: String) {
        self.state.lock().await.context_cache = Some(context);
    }
}

/// Registry of live streams. Reads vastly outnumber writes, so the map is
/// behind a std `RwLock`; per-stream state has its own lock.
pub struct StreamRegistry {
    streams: RwLock<HashMap<StreamId, Arc<ChatStream>>>,
    window_capacity: usize,
}

impl StreamRegistry {
    pub fn new(window_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            window_capacity,
        })
    }

    /// Fetch a stream, creating it lazily. Also the explicit cold-start
    /// entry point for schedules that address a stream before any envelope
    /// has arrived.
    pub fn get_or_create(&self, id: &StreamId, platform: &str) -> Arc<ChatStream> {
        if let Some(stream) = self.streams.read().expect("stream registry poisoned").get(id) {
            return stream.clone();
        }

        let mut streams = self.streams.write().expect("stream registry poisoned");
        streams
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::debug!(stream_id = %id, platform, "chat stream created");
                ChatStream::new(id.clone(), platform.to_string(), self.window_capacity)
            })
            .clone()
    }

    pub fn get(&self, id: &StreamId) -> Option<Arc<ChatStream>> {
        self.streams
            .read()
            .expect("stream registry poisoned")
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.streams.read().expect("stream registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every stream belonging to a platform. Only called on
    /// platform reset.
    pub fn reset_platform(&self, platform: &str) -> usize {
        let mut streams = self.streams.write().expect("stream registry poisoned");
        let before = streams.len();
        streams.retain(|_, stream| stream.platform != platform);
        let dropped = before - streams.len();
        if dropped > 0 {
            tracing::info!(platform, dropped, "platform streams reset");
        }
        dropped
    }
}

/// Durable stream metadata (`chat_streams` table).
pub struct StreamStore {
    pool: SqlitePool,
}

impl StreamStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_streams (
                stream_id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                last_active_ms INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create chat_streams table")?;

        Ok(())
    }

    /// Record stream activity, inserting the row on first sight.
    pub async fn touch(&self, stream: &ChatStream) -> Result<()> {
        let last_active_ms = stream.last_activity_ms().await;
        let message_count = stream.message_count().await as i64;

        sqlx::query(
            r#"
            INSERT INTO chat_streams (stream_id, platform, last_active_ms, message_count)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(stream_id) DO UPDATE SET
                last_active_ms = excluded.last_active_ms,
                message_count = chat_streams.message_count + 1
            "#,
        )
        .bind(stream.id.as_ref())
        .bind(&stream.platform)
        .bind(last_active_ms)
        .bind(message_count)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist stream {}", stream.id))?;

        Ok(())
    }

    /// Known stream ids per platform, for cold-start restores.
    pub async fn known_streams(&self, platform: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT stream_id FROM chat_streams WHERE platform = ?")
            .bind(platform)
            .fetch_all(&self.pool)
            .await
            .context("failed to load chat streams")?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("stream_id").ok())
            .collect())
    }

    pub async fn delete_platform(&self, platform: &str) -> Result<()> {
        sqlx::query("DELETE FROM chat_streams WHERE platform = ?")
            .bind(platform)
            .execute(&self.pool)
            .await
            .context("failed to delete platform streams")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::testing::private_text;

    #[tokio::test]
    async fn window_is_bounded_ring() {
        let registry = StreamRegistry::new(3);
        let envelope = private_text("qq", "1", "m0", 10);
        let stream = registry.get_or_create(&envelope.stream_id(), "qq");

        for index in 0..5 {
            let envelope = private_text("qq", "1", &format!("m{index}"), 10 + index as i64);
            stream.record(&envelope).await;
        }

        let recent = stream.recent(10).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].text, "m2");
        assert_eq!(recent[2].text, "m4");
        assert_eq!(stream.message_count().await, 5);
    }

    #[tokio::test]
    async fn timestamps_never_decrease() {
        let registry = StreamRegistry::new(10);
        let first = private_text("qq", "1", "a", 1_000);
        let stream = registry.get_or_create(&first.stream_id(), "qq");
        stream.record(&first).await;

        let stale = private_text("qq", "1", "b", 500);
        stream.record(&stale).await;

        let recent = stream.recent(10).await;
        assert_eq!(recent[1].timestamp_ms, 1_000);
    }

    #[tokio::test]
    async fn record_invalidates_context_cache() {
        let registry = StreamRegistry::new(10);
        let envelope = private_text("qq", "1", "a", 1);
        let stream = registry.get_or_create(&envelope.stream_id(), "qq");

        stream.cache_context("cached".into()).await;
        assert_eq!(stream.cached_context().await.as_deref(), Some("cached"));

        stream.record(&envelope).await;
        assert!(stream.cached_context().await.is_none());
    }

    #[tokio::test]
    async fn reset_platform_destroys_only_that_platform() {
        let registry = StreamRegistry::new(10);
        let qq = private_text("qq", "1", "a", 1);
        let tg = private_text("telegram", "1", "a", 1);
        registry.get_or_create(&qq.stream_id(), "qq");
        registry.get_or_create(&tg.stream_id(), "telegram");

        assert_eq!(registry.reset_platform("qq"), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&tg.stream_id()).is_some());
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = StreamRegistry::new(10);
        let envelope = private_text("qq", "1", "a", 1);
        let first = registry.get_or_create(&envelope.stream_id(), "qq");
        let second = registry.get_or_create(&envelope.stream_id(), "qq");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
