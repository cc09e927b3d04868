//! Frame Codec
//!
//! Every message on the wire is a frame `{type, payload, id?, timestamp?}`.
//!
//! - **Text frames**: UTF-8 JSON objects
//! - **Binary frames**: `MessagePack` maps with the same field names
//!
//! Decoding accepts either encoding regardless of the configured outbound
//! format. The envelope (`id`, `timestamp`) is filled in when absent.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::application::ports::RawFrame;
use crate::domain::event::{Event, monotonic_millis};

/// Frame types understood by the transport and engine.
pub mod frame_type {
    /// Liveness ping.
    pub const PING: &str = "ping";
    /// Liveness ping response.
    pub const PONG: &str = "pong";
    /// A published event; the payload is the serialized event.
    pub const EVENT: &str = "event";
    /// Peer subscription request; the payload is `{topics: [..]}`.
    pub const SUBSCRIBE: &str = "subscribe";
    /// Peer unsubscription request; the payload is `{topics: [..]}`.
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    /// Outbound mutation write.
    pub const MUTATION: &str = "mutation";
    /// Server applied a mutation.
    pub const MUTATION_ACK: &str = "mutation.ack";
    /// Server holds a diverged value.
    pub const MUTATION_CONFLICT: &str = "mutation.conflict";
    /// Server refused a mutation.
    pub const MUTATION_REJECT: &str = "mutation.reject";
}

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// `MessagePack` encoding failed.
    #[error("`MessagePack` encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// `MessagePack` decoding failed.
    #[error("`MessagePack` decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// A frame without a type.
    #[error("frame type is empty")]
    MissingType,

    /// A close frame has no content.
    #[error("close frames carry no message")]
    Close,
}

/// Outbound wire encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// `MessagePack` binary frames.
    MessagePack,
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "text" => Ok(Self::Json),
            "msgpack" | "messagepack" | "binary" => Ok(Self::MessagePack),
            other => Err(format!("unknown wire format: {other}")),
        }
    }
}

// =============================================================================
// Frame
// =============================================================================

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Message type.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Message body.
    #[serde(default)]
    pub payload: Value,
    /// Unique message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Send time in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Frame {
    /// Create a frame without an envelope.
    #[must_use]
    pub fn new(frame_type: impl Into<String>, payload: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            payload,
            id: None,
            timestamp: None,
        }
    }

    /// A liveness ping.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(frame_type::PING, Value::Null).with_envelope()
    }

    /// Answer a ping, echoing its id.
    #[must_use]
    pub fn pong_for(ping: &Self) -> Self {
        let mut pong = Self::new(frame_type::PONG, Value::Null);
        pong.id.clone_from(&ping.id);
        pong.with_envelope()
    }

    /// Wrap an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized.
    pub fn event(event: &Event) -> Result<Self, CodecError> {
        let mut frame = Self::new(frame_type::EVENT, serde_json::to_value(event)?);
        frame.id = Some(event.id.clone());
        frame.timestamp = Some(event.timestamp);
        Ok(frame)
    }

    /// A subscription request.
    #[must_use]
    pub fn subscribe(topics: &[String]) -> Self {
        Self::new(frame_type::SUBSCRIBE, json!({ "topics": topics }))
    }

    /// A request to stop receiving topics.
    #[must_use]
    pub fn unsubscribe(topics: &[String]) -> Self {
        Self::new(frame_type::UNSUBSCRIBE, json!({ "topics": topics }))
    }

    /// Assign an id and timestamp when absent.
    #[must_use]
    pub fn with_envelope(mut self) -> Self {
        self.ensure_envelope();
        self
    }

    /// Assign an id and timestamp when absent.
    pub fn ensure_envelope(&mut self) {
        if self.id.is_none() {
            self.id = Some(uuid::Uuid::new_v4().to_string());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(monotonic_millis());
        }
    }

    /// Interpret an `event` frame.
    ///
    /// Frames of any other type become an event on a topic named after the
    /// frame type, keeping the frame id. The timestamp always comes from
    /// the local clock.
    #[must_use]
    pub fn into_event(self, source: &str) -> Event {
        if self.frame_type == frame_type::EVENT
            && let Ok(mut event) = serde_json::from_value::<Event>(self.payload.clone())
        {
            event.timestamp = monotonic_millis();
            return event;
        }

        let mut event = Event::new(self.frame_type, source, self.payload);
        if let Some(id) = self.id {
            event.id = id;
        }
        event
    }

    /// Topic list carried by `subscribe`/`unsubscribe` frames.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.payload
            .get("topics")
            .and_then(Value::as_array)
            .map(|topics| {
                topics
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Encodes frames in the configured format and decodes either format.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec {
    format: WireFormat,
}

impl FrameCodec {
    /// Create a codec for the given outbound format.
    #[must_use]
    pub const fn new(format: WireFormat) -> Self {
        Self { format }
    }

    /// The outbound format.
    #[must_use]
    pub const fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, frame: &Frame) -> Result<RawFrame, CodecError> {
        match self.format {
            WireFormat::Json => Ok(RawFrame::Text(serde_json::to_string(frame)?)),
            WireFormat::MessagePack => Ok(RawFrame::Binary(rmp_serde::to_vec_named(frame)?)),
        }
    }

    /// Decode a frame and fill in its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed content, an empty type, or a close frame.
    pub fn decode(&self, raw: &RawFrame) -> Result<Frame, CodecError> {
        let frame: Frame = match raw {
            RawFrame::Text(text) => serde_json::from_str(text.trim())?,
            RawFrame::Binary(bytes) => rmp_serde::from_slice(bytes)?,
            RawFrame::Close => return Err(CodecError::Close),
        };

        if frame.frame_type.trim().is_empty() {
            return Err(CodecError::MissingType);
        }

        Ok(frame.with_envelope())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_json_text() {
        let codec = FrameCodec::default();
        let raw = RawFrame::Text(r#"{"type":"AAPL.update","payload":{"price":10}}"#.to_string());

        let frame = codec.decode(&raw).unwrap();
        assert_eq!(frame.frame_type, "AAPL.update");
        assert_eq!(frame.payload["price"], 10);
        assert!(frame.id.is_some());
        assert!(frame.timestamp.is_some());
    }

    #[test]
    fn keeps_existing_envelope() {
        let codec = FrameCodec::default();
        let raw = RawFrame::Text(r#"{"type":"x","id":"abc","timestamp":42}"#.to_string());

        let frame = codec.decode(&raw).unwrap();
        assert_eq!(frame.id.as_deref(), Some("abc"));
        assert_eq!(frame.timestamp, Some(42));
        assert_eq!(frame.payload, Value::Null);
    }

    #[test]
    fn decodes_msgpack_regardless_of_format() {
        let encoder = FrameCodec::new(WireFormat::MessagePack);
        let frame = Frame::new("sync.success", json!({"id": "m1"})).with_envelope();
        let raw = encoder.encode(&frame).unwrap();
        assert!(matches!(raw, RawFrame::Binary(_)));

        let decoded = FrameCodec::new(WireFormat::Json).decode(&raw).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_malformed_frames() {
        let codec = FrameCodec::default();
        assert!(matches!(
            codec.decode(&RawFrame::Text("not json".into())),
            Err(CodecError::Json(_))
        ));
        assert!(matches!(
            codec.decode(&RawFrame::Text(r#"{"type":" "}"#.into())),
            Err(CodecError::MissingType)
        ));
        assert!(matches!(
            codec.decode(&RawFrame::Binary(vec![0xc1])),
            Err(CodecError::MsgPackDecode(_))
        ));
        assert!(matches!(codec.decode(&RawFrame::Close), Err(CodecError::Close)));
    }

    #[test]
    fn pong_echoes_ping_id() {
        let ping = Frame::ping();
        let pong = Frame::pong_for(&ping);
        assert_eq!(pong.frame_type, frame_type::PONG);
        assert_eq!(pong.id, ping.id);
    }

    #[test]
    fn event_frames_round_trip_to_events() {
        let event = Event::new("AAPL.update", "feed", json!({"price": 10}));
        let frame = Frame::event(&event).unwrap();

        let received = frame.into_event("peer");
        assert_eq!(received.id, event.id);
        assert_eq!(received.topic, event.topic);
        assert_eq!(received.source, "feed");
        assert_eq!(received.payload, event.payload);
        assert!(received.timestamp >= event.timestamp);
    }

    #[test]
    fn peer_timestamps_are_replaced() {
        let mut frame = Frame::new("TSLA.update", json!({"price": 1}));
        frame.timestamp = Some(42);
        let before = monotonic_millis();

        let event = frame.into_event("peer");
        assert!(event.timestamp >= before);
    }

    #[test]
    fn other_frames_become_events_on_their_type() {
        let mut frame = Frame::new("TSLA.update", json!({"price": 1}));
        frame.id = Some("f1".to_string());

        let event = frame.into_event("peer");
        assert_eq!(event.topic, "TSLA.update");
        assert_eq!(event.id, "f1");
        assert_eq!(event.source, "peer");
    }

    #[test]
    fn subscribe_frame_topics() {
        let frame = Frame::subscribe(&["AAPL".to_string(), "MSFT".to_string()]);
        assert_eq!(frame.topics(), vec!["AAPL", "MSFT"]);
        assert!(Frame::new("subscribe", json!({})).topics().is_empty());
    }

    #[test]
    fn wire_format_parse() {
        assert_eq!("json".parse::<WireFormat>(), Ok(WireFormat::Json));
        assert_eq!("MsgPack".parse::<WireFormat>(), Ok(WireFormat::MessagePack));
        assert!("xml".parse::<WireFormat>().is_err());
    }
}
