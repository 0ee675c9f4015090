//! The message envelope: the typed record carrying one platform event
//! between subsystems, plus its JSON wire codec and schema upgrade hook.
//!
//! Envelopes are immutable after ingestion; subsystems share them by value
//! or behind `Arc`. The segment tree is owned, so `seglist` nesting cannot
//! form cycles.

use crate::error::{BusError, Result};
use crate::StreamId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Current envelope schema version. Decoding bumps older payloads through
/// the upgrade chain; newer payloads are rejected as [`BusError::BadEnvelope`].
pub const SCHEMA_VERSION: u32 = 2;

/// Direction of travel relative to the core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Message kind, mirroring the platform's event taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Private,
    Group,
    Notice,
    Meta,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Private => write!(f, "private"),
            MessageKind::Group => write!(f, "group"),
            MessageKind::Notice => write!(f, "notice"),
            MessageKind::Meta => write!(f, "meta"),
        }
    }
}

/// Sender identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UserInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl UserInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            display_name: None,
        }
    }

    /// Best display label: display name, then name, then the raw id.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Group identity, present for group messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Who sent this, where, and whether it addresses the bot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageInfo {
    pub user: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_id: Option<String>,
    #[serde(default)]
    pub to_me: bool,
    pub message_type: MessageKind,
}

/// Media segment payload shared by image, voice, and video segments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MediaPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Platform- or model-produced textual summary of the media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// File segment payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilePayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// One quoted message inside a forward segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardedMessage {
    pub sender: String,
    pub content: Segment,
}

/// Parsed command invocation carried as a segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandPayload {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A node in the message segment tree. Serialises as `{type, data}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Segment {
    Text(String),
    Image(MediaPayload),
    At { user_id: String },
    Face { id: String },
    Reply { message_id: String },
    Forward(Vec<ForwardedMessage>),
    Voice(MediaPayload),
    Video(MediaPayload),
    File(FilePayload),
    Command(CommandPayload),
    Seglist(Vec<Segment>),
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text(text.into())
    }

    /// Flatten the tree into the concatenated text of all text segments.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        match self {
            Segment::Text(text) => out.push_str(text),
            Segment::Seglist(children) => {
                for child in children {
                    child.collect_text(out);
                }
            }
            Segment::Forward(messages) => {
                for message in messages {
                    message.content.collect_text(out);
                }
            }
            _ => {}
        }
    }

    /// First command payload anywhere in the tree, if present.
    pub fn find_command(&self) -> Option<&CommandPayload> {
        match self {
            Segment::Command(payload) => Some(payload),
            Segment::Seglist(children) => children.iter().find_map(Segment::find_command),
            _ => None,
        }
    }

    /// Number of leaf segments in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            Segment::Seglist(children) => children.iter().map(Segment::leaf_count).sum(),
            _ => 1,
        }
    }
}

/// The universal inter-subsystem record for one platform event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEnvelope {
    pub direction: Direction,
    pub platform: String,
    pub message_id: String,
    pub timestamp_ms: i64,
    pub message_info: MessageInfo,
    pub message_segment: Segment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl MessageEnvelope {
    /// Derive the conversation stream id: group chats key on the group,
    /// everything else on the peer user.
    pub fn stream_id(&self) -> StreamId {
        let id = match (&self.message_info.group, self.message_info.message_type) {
            (Some(group), MessageKind::Group) => {
                format!("{}:group:{}", self.platform, group.id)
            }
            _ => format!("{}:private:{}", self.platform, self.message_info.user.id),
        };
        Arc::from(id.as_str())
    }

    /// Concatenated text of the segment tree.
    pub fn plain_text(&self) -> String {
        self.message_segment.plain_text()
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == Direction::Incoming
    }

    /// Build the outgoing text reply addressed to the same conversation.
    pub fn reply_with_text(&self, text: impl Into<String>) -> MessageEnvelope {
        let text = text.into();
        MessageEnvelope {
            direction: Direction::Outgoing,
            platform: self.platform.clone(),
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis().max(self.timestamp_ms),
            message_info: MessageInfo {
                user: self.message_info.user.clone(),
                group: self.message_info.group.clone(),
                self_id: self.message_info.self_id.clone(),
                to_me: false,
                message_type: self.message_info.message_type,
            },
            raw_message: Some(text.clone()),
            message_segment: Segment::Text(text),
            schema_version: SCHEMA_VERSION,
        }
    }
}

/// Batch wire form: `{schema_version, items: [envelope]}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeBatch {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub items: Vec<MessageEnvelope>,
}

/// Encode an envelope to its JSON wire form.
pub fn encode(envelope: &MessageEnvelope) -> Result<String> {
    serde_json::to_string(envelope)
        .map_err(|error| BusError::BadEnvelope(format!("encode failed: {error}")).into())
}

/// Decode an envelope from JSON, upgrading older schema versions.
pub fn decode(json: &str) -> Result<MessageEnvelope> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|error| BusError::BadEnvelope(format!("malformed JSON: {error}")))?;
    decode_value(value)
}

/// Decode from an already-parsed JSON value, upgrading as needed.
pub fn decode_value(mut value: serde_json::Value) -> Result<MessageEnvelope> {
    let mut version = value
        .get("schema_version")
        .and_then(serde_json::Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(SCHEMA_VERSION);

    if version > SCHEMA_VERSION {
        return Err(BusError::BadEnvelope(format!(
            "unsupported schema version {version} (current {SCHEMA_VERSION})"
        ))
        .into());
    }

    while version < SCHEMA_VERSION {
        value = upgrade(value, version)?;
        version += 1;
    }

    serde_json::from_value(value)
        .map_err(|error| BusError::BadEnvelope(format!("missing or invalid field: {error}")).into())
}

/// One upgrade step: `from` → `from + 1`.
///
/// v1 carried `message_segment` as a bare array of segments and had no
/// `to_me` flag. v2 wraps the array in a `seglist` and defaults `to_me`.
fn upgrade(mut value: serde_json::Value, from: u32) -> Result<serde_json::Value> {
    match from {
        1 => {
            if let Some(object) = value.as_object_mut() {
                if let Some(segment) = object.get_mut("message_segment") {
                    if segment.is_array() {
                        let items = segment.take();
                        *segment = serde_json::json!({"type": "seglist", "data": items});
                    }
                }
                if let Some(info) = object.get_mut("message_info").and_then(|i| i.as_object_mut())
                {
                    info.entry("to_me").or_insert(serde_json::Value::Bool(false));
                }
                object.insert("schema_version".into(), serde_json::json!(2));
            }
            Ok(value)
        }
        other => Err(BusError::BadEnvelope(format!("no upgrade path from schema version {other}"))
            .into()),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::private_text;
    use super::*;
    use indoc::indoc;

    #[test]
    fn encode_decode_round_trip() {
        let envelope = private_text("qq", "1", "hello", 1_000);
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn decode_defaults_optional_fields() {
        let json = indoc! {r#"
            {
              "direction": "incoming",
              "platform": "qq",
              "message_id": "m1",
              "timestamp_ms": 5,
              "message_info": {
                "user": {"id": "9"},
                "message_type": "private"
              },
              "message_segment": {"type": "text", "data": "hi"}
            }
        "#};

        let envelope = decode(json).unwrap();
        assert_eq!(envelope.schema_version, SCHEMA_VERSION);
        assert!(!envelope.message_info.to_me);
        assert!(envelope.raw_message.is_none());
    }

    #[test]
    fn upgrades_v1_segment_array() {
        let json = indoc! {r#"
            {
              "schema_version": 1,
              "direction": "incoming",
              "platform": "qq",
              "message_id": "m1",
              "timestamp_ms": 5,
              "message_info": {
                "user": {"id": "9"},
                "message_type": "group",
                "group": {"id": "77"}
              },
              "message_segment": [
                {"type": "at", "data": {"user_id": "bot"}},
                {"type": "text", "data": " hello"}
              ]
            }
        "#};

        let envelope = decode(json).unwrap();
        assert_eq!(envelope.schema_version, SCHEMA_VERSION);
        assert_eq!(envelope.plain_text(), " hello");
        assert_eq!(envelope.message_segment.leaf_count(), 2);
    }

    #[test]
    fn rejects_future_schema_version() {
        let json = format!(
            r#"{{"schema_version": {}, "items": []}}"#,
            SCHEMA_VERSION + 1
        );
        let error = decode(&json).unwrap_err();
        assert!(error.to_string().contains("unsupported schema version"));
    }

    #[test]
    fn rejects_missing_required_fields() {
        assert!(decode(r#"{"platform": "qq"}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn nested_seglist_flattens_text() {
        let segment = Segment::Seglist(vec![
            Segment::text("a"),
            Segment::Seglist(vec![Segment::text("b"), Segment::At { user_id: "x".into() }]),
            Segment::text("c"),
        ]);
        assert_eq!(segment.plain_text(), "abc");
        assert_eq!(segment.leaf_count(), 4);
    }

    #[test]
    fn stream_id_derivation() {
        let mut envelope = private_text("qq", "42", "hi", 1);
        assert_eq!(envelope.stream_id().as_ref(), "qq:private:42");

        envelope.message_info.message_type = MessageKind::Group;
        envelope.message_info.group = Some(GroupInfo {
            id: "300".into(),
            name: None,
        });
        assert_eq!(envelope.stream_id().as_ref(), "qq:group:300");
    }

    #[test]
    fn batch_round_trip() {
        let batch = EnvelopeBatch {
            schema_version: SCHEMA_VERSION,
            items: vec![private_text("qq", "1", "a", 1), private_text("qq", "2", "b", 2)],
        };
        let json = serde_json::to_string(&batch).unwrap();
        let decoded: EnvelopeBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn reply_keeps_conversation_and_direction() {
        let inbound = private_text("qq", "1", "hello", 1_000);
        let reply = inbound.reply_with_text("hi there");
        assert_eq!(reply.direction, Direction::Outgoing);
        assert_eq!(reply.stream_id(), inbound.stream_id());
        assert!(reply.timestamp_ms >= inbound.timestamp_ms);
        assert_eq!(reply.plain_text(), "hi there");
    }
}
