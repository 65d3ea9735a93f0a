use crate::types::Attachment;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("unauthorized (401): session credential rejected")]
    Unauthorized,
    #[error("service unreachable: {0}")]
    Unreachable(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection closed (code: {0})")]
    Closed(u16),
    #[error("keep alive failed")]
    KeepAliveFailed,
    #[error("server closed connection")]
    ServerClosed,
    #[error("invalid websocket")]
    InvalidWebsocket,
    #[error("received invalid data: {0}")]
    InvalidData(String),
    #[error("message type not implemented: {0}")]
    NotImplemented(String),
    #[error("not connected")]
    NotConnected,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Restart,
    Ignore,
    Log,
}

impl TransportError {
    pub fn from_signature(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("401") || lower.contains("unauthorized") {
            Self::Unauthorized
        } else if lower.contains("bad handshake") || lower.contains("timed out") {
            Self::Unreachable(text.to_string())
        } else if let Some(code) = parse_close_code(&lower) {
            Self::Closed(code)
        } else if lower.contains("keep alive") || lower.contains("keepalive") {
            Self::KeepAliveFailed
        } else if lower.contains("server closed connection") {
            Self::ServerClosed
        } else if lower.contains("invalid websocket") || lower.contains("corrupted") {
            Self::InvalidWebsocket
        } else if lower.contains("received invalid data") {
            Self::InvalidData(text.to_string())
        } else if lower.contains("not implemented") {
            Self::NotImplemented(text.to_string())
        } else if lower.contains("not connected") {
            Self::NotConnected
        } else if lower.contains("connection failed") {
            Self::ConnectionFailed(text.to_string())
        } else {
            Self::Other(text.to_string())
        }
    }

    pub fn action(&self) -> ErrorAction {
        match self {
            Self::ConnectionFailed(_)
            | Self::Closed(_)
            | Self::KeepAliveFailed
            | Self::ServerClosed
            | Self::InvalidWebsocket => ErrorAction::Restart,
            Self::InvalidData(_) | Self::NotImplemented(_) => ErrorAction::Ignore,
            Self::Unauthorized | Self::Unreachable(_) | Self::NotConnected | Self::Other(_) => {
                ErrorAction::Log
            }
        }
    }
}

fn parse_close_code(lower: &str) -> Option<u16> {
    let rest = &lower[lower.find("code:")? + "code:".len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential(Vec<u8>);

impl SessionCredential {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn encode(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn decode(encoded: &str) -> Result<Self, base64::DecodeError> {
        STANDARD.decode(encoded.trim()).map(Self)
    }
}

impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionCredential({} bytes)", self.0.len())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub participant: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, with = "base64_bytes")]
    pub media_key: Vec<u8>,
    #[serde(default)]
    pub file_length: u64,
    #[serde(default)]
    pub mimetype: String,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioPayload {
    pub url: String,
    #[serde(default, with = "base64_bytes")]
    pub media_key: Vec<u8>,
    #[serde(default)]
    pub file_length: u64,
    #[serde(default)]
    pub mimetype: String,
    #[serde(default)]
    pub seconds: u32,
    #[serde(default)]
    pub ptt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub url: String,
    #[serde(default, with = "base64_bytes")]
    pub media_key: Vec<u8>,
    #[serde(default)]
    pub file_length: u64,
    #[serde(default)]
    pub mimetype: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Text {
        info: MessageInfo,
        text: String,
    },
    Image {
        info: MessageInfo,
        image: ImagePayload,
    },
    Audio {
        info: MessageInfo,
        audio: AudioPayload,
    },
    Document {
        info: MessageInfo,
        document: DocumentPayload,
    },
    Location {
        info: MessageInfo,
        latitude: f64,
        longitude: f64,
    },
    LiveLocation {
        info: MessageInfo,
        latitude: f64,
        longitude: f64,
    },
    Contact {
        info: MessageInfo,
        #[serde(default)]
        display_name: String,
    },
}

impl InboundEvent {
    pub fn info(&self) -> &MessageInfo {
        match self {
            Self::Text { info, .. }
            | Self::Image { info, .. }
            | Self::Audio { info, .. }
            | Self::Document { info, .. }
            | Self::Location { info, .. }
            | Self::LiveLocation { info, .. }
            | Self::Contact { info, .. } => info,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Audio { .. } => "audio",
            Self::Document { .. } => "document",
            Self::Location { .. } => "location",
            Self::LiveLocation { .. } => "live_location",
            Self::Contact { .. } => "contact",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    Text {
        to: String,
        text: String,
    },
    Audio {
        to: String,
        mime: String,
        length: u64,
        ptt: bool,
        content: Bytes,
    },
    Image {
        to: String,
        caption: String,
        mime: String,
        content: Bytes,
    },
    Document {
        to: String,
        title: String,
        file_name: String,
        mime: String,
        content: Bytes,
    },
}

impl OutgoingMessage {
    pub fn recipient(&self) -> &str {
        match self {
            Self::Text { to, .. }
            | Self::Audio { to, .. }
            | Self::Image { to, .. }
            | Self::Document { to, .. } => to,
        }
    }
}

/// Receives events from a connection. Calls for one connection are made one
/// at a time, in network order.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: InboundEvent);
    async fn handle_error(&self, error: TransportError);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, timeout: Duration) -> Result<Arc<dyn Transport>, TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn own_id(&self) -> Option<String>;

    fn contact_title(&self, _jid: &str) -> Option<String> {
        None
    }

    async fn login(
        &self,
        qr: mpsc::Sender<String>,
    ) -> Result<(String, SessionCredential), TransportError>;

    async fn restore_session(
        &self,
        credential: SessionCredential,
    ) -> Result<SessionCredential, TransportError>;

    async fn send(&self, message: OutgoingMessage) -> Result<String, TransportError>;

    async fn add_handler(&self, handler: Arc<dyn EventHandler>);

    async fn remove_handlers(&self);

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Replays up to `count` past messages of `conversation` into `handler`,
    /// sleeping `pacing` after each request to the network.
    async fn load_history(
        &self,
        conversation: &str,
        count: usize,
        pacing: Duration,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), TransportError>;

    async fn download(&self, attachment: &Attachment) -> Result<Bytes, TransportError>;
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.trim()).map_err(serde::de::Error::custom)
    }
}
