//! Wire protocol message types for the control socket.
//!
//! All messages are MessagePack-encoded maps with at minimum `type` and
//! `id` fields.

use serde::{Deserialize, Serialize};

/// All wire protocol messages.
///
/// Serialized as a tagged union on the `type` field via MessagePack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    // -- Handshake --
    #[serde(rename = "hello")]
    Hello { id: u32, version: u32 },

    #[serde(rename = "hello_ack")]
    HelloAck {
        id: u32,
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // -- Clipboards --
    #[serde(rename = "list_clipboards")]
    ListClipboards { id: u32 },

    #[serde(rename = "add_clipboard")]
    AddClipboard {
        id: u32,
        label: String,
        #[serde(default)]
        max_entries: Option<u32>,
    },

    #[serde(rename = "rename_clipboard")]
    RenameClipboard {
        id: u32,
        clipboard: String,
        label: String,
    },

    #[serde(rename = "list_endpoints")]
    ListEndpoints { id: u32, clipboard: String },

    // -- Entries --
    #[serde(rename = "get_entry")]
    GetEntry {
        id: u32,
        clipboard: String,
        index: u32,
        /// Return the bytes recorded under this mime type.
        #[serde(default)]
        mime_type: Option<String>,
    },

    #[serde(rename = "get_entry_by_id")]
    GetEntryById {
        id: u32,
        entry_id: String,
        #[serde(default)]
        mime_type: Option<String>,
    },

    #[serde(rename = "list_entries")]
    ListEntries {
        id: u32,
        clipboard: String,
        #[serde(default)]
        limit: Option<u32>,
    },

    #[serde(rename = "set_starred")]
    SetStarred {
        id: u32,
        entry_id: String,
        starred: bool,
    },

    #[serde(rename = "remove_entry")]
    RemoveEntry { id: u32, entry_id: String },

    #[serde(rename = "clear_history")]
    ClearHistory { id: u32, clipboard: String },

    #[serde(rename = "activate_entry")]
    ActivateEntry { id: u32, entry_id: String },

    // -- Generic response --
    #[serde(rename = "response")]
    Response(Response),
}

impl Message {
    /// Request id carried by every variant.
    pub fn id(&self) -> u32 {
        match self {
            Message::Hello { id, .. }
            | Message::HelloAck { id, .. }
            | Message::ListClipboards { id }
            | Message::AddClipboard { id, .. }
            | Message::RenameClipboard { id, .. }
            | Message::ListEndpoints { id, .. }
            | Message::GetEntry { id, .. }
            | Message::GetEntryById { id, .. }
            | Message::ListEntries { id, .. }
            | Message::SetStarred { id, .. }
            | Message::RemoveEntry { id, .. }
            | Message::ClearHistory { id, .. }
            | Message::ActivateEntry { id, .. } => *id,
            Message::Response(response) => response.id,
        }
    }
}

/// Body of a `response` message. Only the fields relevant to the
/// request are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: u32,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clipboards: Option<Vec<ClipboardDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntryDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub content: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<EndpointDescriptor>>,
    /// Number of entries removed by `clear_history`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<u32>,
}

impl Response {
    pub fn ok(id: u32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn error(id: u32, reason: &str) -> Self {
        Self {
            id,
            status: Status::Error,
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Ok,
    Error,
}

/// Clipboard row returned by `list_clipboards`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClipboardDescriptor {
    pub label: String,
    pub max_entries: u32,
    pub entries: u32,
    pub endpoints: u32,
}

/// Entry metadata. Content travels separately in [`Response::content`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryDescriptor {
    pub entry_id: String,
    pub clipboard: String,
    pub index: u64,
    pub creation_time: u64,
    pub last_used_time: u64,
    pub starred: bool,
    pub mime_types: Vec<String>,
    pub byte_length: u64,
}

/// Endpoint attachment returned by `list_endpoints`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub label: String,
    pub transport: String,
    pub selection: String,
}

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Minimal envelope for extracting `{type, id}` from unknown messages.
///
/// Used by the daemon as a fallback when [`Message`] deserialization
/// fails (e.g., unknown `type` tag), so the error response can echo the
/// request `id`.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    /// Consumed by serde for structural matching; not read by daemon code.
    #[serde(rename = "type")]
    #[allow(dead_code)]
    pub msg_type: String,
    pub id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &Message) -> Message {
        let encoded = rmp_serde::to_vec_named(msg).unwrap();
        rmp_serde::from_slice(&encoded).unwrap()
    }

    #[test]
    fn hello_ack_error_round_trip() {
        let msg = Message::HelloAck {
            id: 0,
            status: Status::Error,
            error: Some("version_mismatch".into()),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn optional_request_fields_default_when_absent() {
        #[derive(serde::Serialize)]
        struct Bare {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
            clipboard: String,
            index: u32,
        }
        let encoded = rmp_serde::to_vec_named(&Bare {
            msg_type: "get_entry",
            id: 4,
            clipboard: "main".into(),
            index: 2,
        })
        .unwrap();
        let decoded: Message = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(
            decoded,
            Message::GetEntry {
                id: 4,
                clipboard: "main".into(),
                index: 2,
                mime_type: None,
            }
        );
    }

    #[test]
    fn response_is_tagged_flat_map() {
        let msg = Message::Response(Response {
            removed: Some(3),
            ..Response::ok(9)
        });
        let encoded = rmp_serde::to_vec_named(&msg).unwrap();

        #[derive(Deserialize)]
        struct Flat {
            #[serde(rename = "type")]
            msg_type: String,
            id: u32,
            status: Status,
            removed: u32,
        }
        let flat: Flat = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(flat.msg_type, "response");
        assert_eq!(flat.id, 9);
        assert_eq!(flat.status, Status::Ok);
        assert_eq!(flat.removed, 3);
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn response_with_entry_and_binary_content() {
        let content: Vec<u8> = (0..=255).collect();
        let msg = Message::Response(Response {
            entry: Some(EntryDescriptor {
                entry_id: "e1".into(),
                clipboard: "main".into(),
                index: 7,
                creation_time: 1000,
                last_used_time: 2000,
                starred: true,
                mime_types: vec!["image/png".into(), "text/plain".into()],
                byte_length: 256,
            }),
            content: Some(content.clone()),
            ..Response::ok(3)
        });
        match round_trip(&msg) {
            Message::Response(r) => {
                assert_eq!(r.content.unwrap(), content);
                assert_eq!(r.entry.unwrap().index, 7);
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn error_response_carries_reason() {
        let msg: Message = Response::error(5, "not_found").into();
        assert_eq!(msg.id(), 5);
        match round_trip(&msg) {
            Message::Response(r) => {
                assert_eq!(r.status, Status::Error);
                assert_eq!(r.error.as_deref(), Some("not_found"));
                assert!(r.entries.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn raw_envelope_from_unknown_type() {
        #[derive(serde::Serialize)]
        struct Unknown {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
            extra: bool,
        }
        let encoded = rmp_serde::to_vec_named(&Unknown {
            msg_type: "teleport",
            id: 42,
            extra: true,
        })
        .unwrap();
        assert!(rmp_serde::from_slice::<Message>(&encoded).is_err());
        let envelope: RawEnvelope = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(envelope.id, 42);
    }
}
