//! Envelope encoding and validation.
//!
//! Wire shape:
//!
//! ```text
//! {"source": "sandbox-host", "version": 1, "payload": {"type": "ready"}}
//! ```
//!
//! Decoding never fails loudly: a frame is either accepted as a typed
//! message or dropped with a reason the caller can log.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Constant tag identifying frames that belong to this protocol.
pub const SOURCE_TAG: &str = "sandbox-host";

/// Only frames carrying exactly this version are accepted.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Message kinds ────────────────────────────────────────

/// Messages sent by the host to the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// First message on every fresh child, sent once the transport is up.
    Init {
        content_ref: String,
        read_only: bool,
        instance_id: Uuid,
    },
    SetContent {
        content: String,
    },
    SetReadOnly {
        read_only: bool,
    },
    /// Snapshot of the host presentation variables.
    SetStyle {
        variables: BTreeMap<String, String>,
    },
    Focus,
    Blur,
}

/// Messages sent by the child to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// The child finished its own load and can receive style and content.
    Ready,
    ContentChanged {
        content: String,
    },
    TitleChanged {
        title: String,
    },
    SaveRequested,
    ErrorReport {
        category: String,
        message: String,
        #[serde(default)]
        fatal: bool,
    },
    /// Content height in CSS pixels. Fractional values are rounded.
    HeightChanged {
        #[serde(deserialize_with = "css_pixels")]
        height: u32,
    },
    NavigateRequest {
        target: String,
    },
}

fn css_pixels<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    if !raw.is_finite() || raw < 0.0 || raw > f64::from(u32::MAX) {
        return Err(serde::de::Error::custom(format!("height out of range: {raw}")));
    }
    Ok(raw.round() as u32)
}

/// Payload types that know their own wire kind names.
pub trait PayloadKinds {
    const KINDS: &'static [&'static str];
}

impl PayloadKinds for HostMessage {
    const KINDS: &'static [&'static str] = &[
        "init",
        "set_content",
        "set_read_only",
        "set_style",
        "focus",
        "blur",
    ];
}

impl PayloadKinds for ChildMessage {
    const KINDS: &'static [&'static str] = &[
        "ready",
        "content_changed",
        "title_changed",
        "save_requested",
        "error_report",
        "height_changed",
        "navigate_request",
    ];
}

impl ChildMessage {
    /// Wire name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ChildMessage::Ready => "ready",
            ChildMessage::ContentChanged { .. } => "content_changed",
            ChildMessage::TitleChanged { .. } => "title_changed",
            ChildMessage::SaveRequested => "save_requested",
            ChildMessage::ErrorReport { .. } => "error_report",
            ChildMessage::HeightChanged { .. } => "height_changed",
            ChildMessage::NavigateRequest { .. } => "navigate_request",
        }
    }
}

impl HostMessage {
    /// Wire name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            HostMessage::Init { .. } => "init",
            HostMessage::SetContent { .. } => "set_content",
            HostMessage::SetReadOnly { .. } => "set_read_only",
            HostMessage::SetStyle { .. } => "set_style",
            HostMessage::Focus => "focus",
            HostMessage::Blur => "blur",
        }
    }
}

// ── Envelope ─────────────────────────────────────────────

#[derive(Serialize)]
struct OutgoingEnvelope<'a, P> {
    source: &'a str,
    version: u32,
    payload: &'a P,
}

/// Loosely typed envelope used to check the tag and version before the
/// payload is interpreted.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    version: Option<u64>,
    #[serde(default)]
    payload: Value,
}

/// Why a frame was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Not JSON, or the payload does not fit its declared kind.
    Malformed(String),
    /// Missing or foreign source tag.
    ForeignSource(Option<String>),
    /// Missing or unrecognized protocol version.
    UnsupportedVersion(Option<u64>),
    /// Well-formed envelope with a kind this side does not handle.
    UnknownKind(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Malformed(detail) => write!(f, "malformed frame: {detail}"),
            DropReason::ForeignSource(Some(source)) => write!(f, "foreign source tag '{source}'"),
            DropReason::ForeignSource(None) => write!(f, "missing source tag"),
            DropReason::UnsupportedVersion(Some(v)) => write!(f, "unsupported version {v}"),
            DropReason::UnsupportedVersion(None) => write!(f, "missing version"),
            DropReason::UnknownKind(kind) => write!(f, "unknown message kind '{kind}'"),
        }
    }
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<T> {
    Accepted(T),
    Dropped(DropReason),
}

/// Serializes a payload into a single-line envelope frame.
pub fn encode<P: Serialize>(payload: &P) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutgoingEnvelope {
        source: SOURCE_TAG,
        version: PROTOCOL_VERSION,
        payload,
    })
}

/// Decodes a frame sent by the child.
pub fn decode_child(frame: &str) -> Inbound<ChildMessage> {
    decode(frame)
}

/// Decodes a frame sent by the host. Used by child implementations.
pub fn decode_host(frame: &str) -> Inbound<HostMessage> {
    decode(frame)
}

fn decode<T: DeserializeOwned + PayloadKinds>(frame: &str) -> Inbound<T> {
    let raw: RawEnvelope = match serde_json::from_str(frame.trim()) {
        Ok(raw) => raw,
        Err(e) => return Inbound::Dropped(DropReason::Malformed(e.to_string())),
    };

    if raw.source.as_deref() != Some(SOURCE_TAG) {
        return Inbound::Dropped(DropReason::ForeignSource(raw.source));
    }
    if raw.version != Some(u64::from(PROTOCOL_VERSION)) {
        return Inbound::Dropped(DropReason::UnsupportedVersion(raw.version));
    }

    let kind = match raw.payload.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => {
            return Inbound::Dropped(DropReason::Malformed(
                "payload has no 'type' field".into(),
            ))
        }
    };
    if !T::KINDS.contains(&kind.as_str()) {
        return Inbound::Dropped(DropReason::UnknownKind(kind));
    }

    match serde_json::from_value(raw.payload) {
        Ok(message) => Inbound::Accepted(message),
        Err(e) => Inbound::Dropped(DropReason::Malformed(format!("{kind}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> String {
        value.to_string()
    }

    // ── Accepted frames ─────────────────────────────────

    #[test]
    fn test_decode_ready() {
        let f = frame(json!({"source": "sandbox-host", "version": 1, "payload": {"type": "ready"}}));
        assert_eq!(decode_child(&f), Inbound::Accepted(ChildMessage::Ready));
    }

    #[test]
    fn test_decode_error_report_fatal_defaults_to_false() {
        let f = frame(json!({
            "source": "sandbox-host",
            "version": 1,
            "payload": {"type": "error_report", "category": "network", "message": "offline"}
        }));
        assert_eq!(
            decode_child(&f),
            Inbound::Accepted(ChildMessage::ErrorReport {
                category: "network".into(),
                message: "offline".into(),
                fatal: false,
            })
        );
    }

    #[test]
    fn test_decode_navigate_request_keeps_target_verbatim() {
        let f = frame(json!({
            "source": "sandbox-host",
            "version": 1,
            "payload": {"type": "navigate_request", "target": "/tables/users?sort=desc#top"}
        }));
        match decode_child(&f) {
            Inbound::Accepted(ChildMessage::NavigateRequest { target }) => {
                assert_eq!(target, "/tables/users?sort=desc#top");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_decode_height_rounds_fractional_pixels() {
        for (raw, expected) in [(json!(480), 480), (json!(312.4), 312), (json!(312.5), 313)] {
            let f = frame(json!({
                "source": "sandbox-host",
                "version": 1,
                "payload": {"type": "height_changed", "height": raw}
            }));
            assert_eq!(
                decode_child(&f),
                Inbound::Accepted(ChildMessage::HeightChanged { height: expected })
            );
        }
    }

    #[test]
    fn test_negative_height_is_malformed() {
        let f = frame(json!({
            "source": "sandbox-host",
            "version": 1,
            "payload": {"type": "height_changed", "height": -4.0}
        }));
        assert!(matches!(decode_child(&f), Inbound::Dropped(DropReason::Malformed(_))));
    }

    #[test]
    fn test_decode_tolerates_trailing_newline() {
        let f = format!(
            "{}\n",
            frame(json!({"source": "sandbox-host", "version": 1, "payload": {"type": "save_requested"}}))
        );
        assert_eq!(decode_child(&f), Inbound::Accepted(ChildMessage::SaveRequested));
    }

    // ── Dropped frames ──────────────────────────────────

    #[test]
    fn test_foreign_source_is_dropped() {
        let f = frame(json!({"source": "devtools", "version": 1, "payload": {"type": "ready"}}));
        assert_eq!(
            decode_child(&f),
            Inbound::Dropped(DropReason::ForeignSource(Some("devtools".into())))
        );
    }

    #[test]
    fn test_missing_source_is_dropped() {
        let f = frame(json!({"version": 1, "payload": {"type": "ready"}}));
        assert_eq!(decode_child(&f), Inbound::Dropped(DropReason::ForeignSource(None)));
    }

    #[test]
    fn test_newer_version_is_dropped() {
        let f = frame(json!({"source": "sandbox-host", "version": 2, "payload": {"type": "ready"}}));
        assert_eq!(
            decode_child(&f),
            Inbound::Dropped(DropReason::UnsupportedVersion(Some(2)))
        );
    }

    #[test]
    fn test_missing_version_is_dropped() {
        let f = frame(json!({"source": "sandbox-host", "payload": {"type": "ready"}}));
        assert_eq!(
            decode_child(&f),
            Inbound::Dropped(DropReason::UnsupportedVersion(None))
        );
    }

    #[test]
    fn test_unknown_kind_is_dropped() {
        let f = frame(json!({"source": "sandbox-host", "version": 1, "payload": {"type": "explode"}}));
        assert_eq!(
            decode_child(&f),
            Inbound::Dropped(DropReason::UnknownKind("explode".into()))
        );
    }

    #[test]
    fn test_host_kind_is_unknown_to_host() {
        // A host message echoed back by the child is not a child message.
        let f = frame(json!({"source": "sandbox-host", "version": 1, "payload": {"type": "focus"}}));
        assert_eq!(
            decode_child(&f),
            Inbound::Dropped(DropReason::UnknownKind("focus".into()))
        );
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let f = frame(json!({"source": "sandbox-host", "version": 1, "payload": {"type": "title_changed"}}));
        assert!(matches!(decode_child(&f), Inbound::Dropped(DropReason::Malformed(_))));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            decode_child("not json at all"),
            Inbound::Dropped(DropReason::Malformed(_))
        ));
        assert!(matches!(
            decode_child(r#"{"source":"sandbox-host","version":1,"payload":{}}"#),
            Inbound::Dropped(DropReason::Malformed(_))
        ));
    }

    // ── Encoding ────────────────────────────────────────

    #[test]
    fn test_encode_set_style_wire_shape() {
        let mut variables = BTreeMap::new();
        variables.insert("--background".to_string(), "#101010".to_string());
        let encoded = encode(&HostMessage::SetStyle { variables }).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({
                "source": "sandbox-host",
                "version": 1,
                "payload": {"type": "set_style", "variables": {"--background": "#101010"}}
            })
        );
    }

    #[test]
    fn test_encoded_frame_is_single_line() {
        let encoded = encode(&HostMessage::SetContent {
            content: "line one\nline two".into(),
        })
        .unwrap();
        assert!(!encoded.contains('\n'));
    }

    #[test]
    fn test_host_frame_decodes_on_child_side() {
        let id = Uuid::new_v4();
        let encoded = encode(&HostMessage::Init {
            content_ref: "doc-1".into(),
            read_only: true,
            instance_id: id,
        })
        .unwrap();
        assert_eq!(
            decode_host(&encoded),
            Inbound::Accepted(HostMessage::Init {
                content_ref: "doc-1".into(),
                read_only: true,
                instance_id: id,
            })
        );
    }

    #[test]
    fn test_kind_names_match_kind_tables() {
        assert!(ChildMessage::KINDS.contains(&ChildMessage::SaveRequested.kind()));
        assert!(HostMessage::KINDS.contains(&HostMessage::Blur.kind()));
    }
}
