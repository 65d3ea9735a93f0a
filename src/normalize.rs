use crate::transport::{InboundEvent, MessageInfo};
use crate::types::{Attachment, Endpoint, Message};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Display phone number for a network address: `"+"` followed by the leading
/// digits of the id. Group addresses and ids without digits have no phone.
pub fn phone_from_id(id: &str) -> String {
    if id.ends_with("@g.us") {
        return String::new();
    }
    let digits: String = id
        .trim_start_matches('+')
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        String::new()
    } else {
        format!("+{digits}")
    }
}

pub fn endpoint(id: &str, titles: &dyn Fn(&str) -> Option<String>) -> Endpoint {
    Endpoint {
        id: id.to_string(),
        phone: phone_from_id(id),
        title: titles(id).filter(|title| !title.trim().is_empty()),
    }
}

fn attachment(url: &str, media_key: &[u8], length: u64, mime: &str) -> Attachment {
    Attachment {
        url: url.to_string(),
        b64_media_key: STANDARD.encode(media_key),
        length,
        mime: mime.to_string(),
    }
}

pub fn normalize(
    event: &InboundEvent,
    controller_id: &str,
    titles: &dyn Fn(&str) -> Option<String>,
) -> Option<Message> {
    let info: &MessageInfo = event.info();
    if info.id.trim().is_empty() {
        return None;
    }

    let participant = info
        .participant
        .as_deref()
        .filter(|p| !p.is_empty() && *p != info.remote_jid)
        .map(|p| endpoint(p, titles));

    let mut message = Message {
        id: info.id.clone(),
        timestamp: info.timestamp,
        controller: endpoint(controller_id, titles),
        reply_to: endpoint(&info.remote_jid, titles),
        participant,
        from_me: info.from_me,
        text: String::new(),
        attachment: None,
    };

    match event {
        InboundEvent::Text { text, .. } => {
            message.text = text.clone();
        }
        InboundEvent::Image { image, .. } => {
            message.text = match image.caption.as_deref().filter(|c| !c.is_empty()) {
                Some(caption) => caption.to_string(),
                None => format!("Image received: {}", image.mimetype),
            };
            message.attachment = Some(attachment(
                image.url.as_deref().unwrap_or_default(),
                &image.media_key,
                image.file_length,
                &image.mimetype,
            ));
        }
        InboundEvent::Audio { audio, .. } => {
            message.text = format!("Audio received: {}", audio.mimetype);
            message.attachment = Some(attachment(
                &audio.url,
                &audio.media_key,
                audio.file_length,
                &audio.mimetype,
            ));
        }
        InboundEvent::Document { document, .. } => {
            message.text = format!(
                "Document received: {} :: {}",
                document.mimetype, document.file_name
            );
            message.attachment = Some(attachment(
                &document.url,
                &document.media_key,
                document.file_length,
                &document.mimetype,
            ));
        }
        InboundEvent::Location {
            latitude,
            longitude,
            ..
        } => {
            message.text = format!("Location received: {latitude},{longitude}");
        }
        InboundEvent::LiveLocation {
            latitude,
            longitude,
            ..
        } => {
            message.text = format!("Live location received: {latitude},{longitude}");
        }
        InboundEvent::Contact { display_name, .. } => {
            message.text = format!("Contact received: {display_name}");
        }
    }

    Some(message)
}
