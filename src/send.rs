use crate::normalize::phone_from_id;
use crate::registry::Registry;
use crate::transport::{ErrorAction, OutgoingMessage, TransportError};
use crate::types::{Endpoint, SendAttachment, SendRequest, SendResponse};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use thiserror::Error;

const ALLOWED_SUFFIXES: [&str; 2] = ["s.whatsapp.net", "g.us"];

#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid recipient {0}")]
    InvalidRecipient(String),
    #[error("incomplete recipient {0}")]
    IncompleteRecipient(String),
    #[error("server not found or not ready")]
    NotReady,
    #[error("invalid attachment: {0}")]
    InvalidAttachment(String),
    #[error("invalid length")]
    InvalidAttachmentLength,
    #[error("invalid text length")]
    InvalidTextLength,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SendError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRecipient(_)
                | Self::IncompleteRecipient(_)
                | Self::InvalidAttachment(_)
                | Self::InvalidAttachmentLength
                | Self::InvalidTextLength
        )
    }
}

pub fn validate_recipient(recipient: &str) -> Result<String, SendError> {
    let recipient = recipient.trim().trim_start_matches('+');
    match recipient.split_once('@') {
        Some((user, suffix)) if !user.is_empty() && ALLOWED_SUFFIXES.contains(&suffix) => {
            Ok(recipient.to_string())
        }
        Some(_) => Err(SendError::InvalidRecipient(recipient.to_string())),
        None => Err(SendError::IncompleteRecipient(recipient.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio { ptt: bool },
    Image,
    Document,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Self {
        let base = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        if base.starts_with("audio/") {
            Self::Audio {
                ptt: base == "audio/ogg",
            }
        } else if base.starts_with("image/") {
            Self::Image
        } else {
            Self::Document
        }
    }
}

pub fn caption_from_filename(file_name: &str) -> String {
    file_name
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn attachment_message(to: &str, attachment: &SendAttachment) -> Result<OutgoingMessage, SendError> {
    let content = STANDARD
        .decode(attachment.base64.trim())
        .map_err(|err| SendError::InvalidAttachment(err.to_string()))?;
    let content = Bytes::from(content);
    let caption = caption_from_filename(&attachment.file_name);
    let mime = attachment.mime.clone();

    Ok(match MediaKind::from_mime(&mime) {
        MediaKind::Audio { ptt } => OutgoingMessage::Audio {
            to: to.to_string(),
            mime,
            length: attachment.length,
            ptt,
            content,
        },
        MediaKind::Image => OutgoingMessage::Image {
            to: to.to_string(),
            caption,
            mime,
            content,
        },
        MediaKind::Document => OutgoingMessage::Document {
            to: to.to_string(),
            title: caption,
            file_name: attachment.file_name.clone(),
            mime,
            content,
        },
    })
}

/// Picks the message kind for a validated recipient. An attachment with a
/// positive length wins over text.
pub fn build_outgoing(to: &str, text: &str, attachment: Option<&SendAttachment>) -> Result<OutgoingMessage, SendError> {
    if let Some(attachment) = attachment.filter(|a| a.length > 0) {
        return attachment_message(to, attachment);
    }
    if !text.is_empty() {
        return Ok(OutgoingMessage::Text {
            to: to.to_string(),
            text: text.to_string(),
        });
    }
    if attachment.is_some() {
        Err(SendError::InvalidAttachmentLength)
    } else {
        Err(SendError::InvalidTextLength)
    }
}

pub async fn send(registry: &Registry, bot_id: &str, request: &SendRequest) -> Result<SendResponse, SendError> {
    let recipient = validate_recipient(&request.recipient)?;
    let server = registry.get(bot_id).ok_or(SendError::NotReady)?;
    let message = build_outgoing(&recipient, &request.text, request.attachment.as_ref())?;

    match server.send_message(message).await {
        Ok(message_id) => Ok(SendResponse {
            message_id,
            chat: Endpoint {
                id: recipient.clone(),
                phone: phone_from_id(&recipient),
                title: server.contact_title(&recipient),
            },
            from: Endpoint {
                id: server.id().to_string(),
                phone: server.number().to_string(),
                title: None,
            },
        }),
        Err(err) => {
            match request.attachment.as_ref().filter(|a| a.length > 0) {
                Some(attachment) => tracing::warn!(
                    bot = %server.number(),
                    %recipient,
                    mime = %attachment.mime,
                    file_name = %attachment.file_name,
                    length = attachment.length,
                    "error sending attachment: {err}"
                ),
                None => tracing::warn!(bot = %server.number(), %recipient, "error sending text message: {err}"),
            }
            if let SendError::Transport(transport_err) = &err {
                if transport_err.action() == ErrorAction::Restart {
                    server.schedule_restart();
                }
            }
            Err(err)
        }
    }
}
