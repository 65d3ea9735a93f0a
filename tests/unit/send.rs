use wa_gateway::send::{build_outgoing, validate_recipient, SendError};
use wa_gateway::transport::OutgoingMessage;
use wa_gateway::types::SendAttachment;

#[test]
fn test_recipient_table() {
    assert_eq!(
        validate_recipient("5511999@s.whatsapp.net").unwrap(),
        "5511999@s.whatsapp.net"
    );
    assert_eq!(validate_recipient("group@g.us").unwrap(), "group@g.us");

    let err = validate_recipient("user@othernetwork").unwrap_err();
    assert!(matches!(err, SendError::InvalidRecipient(_)));
    assert_eq!(err.to_string(), "invalid recipient user@othernetwork");

    let err = validate_recipient("5511999").unwrap_err();
    assert!(matches!(err, SendError::IncompleteRecipient(_)));
    assert_eq!(err.to_string(), "incomplete recipient 5511999");
}

#[test]
fn test_recipient_edge_cases() {
    assert!(matches!(
        validate_recipient("@s.whatsapp.net"),
        Err(SendError::InvalidRecipient(_))
    ));
    assert!(matches!(
        validate_recipient("a@g.us.evil"),
        Err(SendError::InvalidRecipient(_))
    ));
    assert_eq!(validate_recipient("++1@g.us").unwrap(), "1@g.us");
}

#[test]
fn test_no_text_no_attachment() {
    let err = build_outgoing("1@s.whatsapp.net", "", None).unwrap_err();
    assert!(matches!(err, SendError::InvalidTextLength));
    assert!(err.is_validation());
}

#[test]
fn test_empty_attachment_without_text() {
    let attachment = SendAttachment::default();
    let err = build_outgoing("1@s.whatsapp.net", "", Some(&attachment)).unwrap_err();
    assert!(matches!(err, SendError::InvalidAttachmentLength));
    assert_eq!(err.to_string(), "invalid length");
}

#[test]
fn test_text_message() {
    let message = build_outgoing("1@s.whatsapp.net", "hi", None).unwrap();
    assert_eq!(
        message,
        OutgoingMessage::Text {
            to: "1@s.whatsapp.net".to_string(),
            text: "hi".to_string()
        }
    );
}

#[test]
fn test_voice_note_attachment() {
    let attachment = SendAttachment {
        base64: "T2dnUw==".to_string(),
        file_name: "voice.ogg".to_string(),
        mime: "audio/ogg; codecs=opus".to_string(),
        length: 4,
    };
    match build_outgoing("1@s.whatsapp.net", "ignored", Some(&attachment)).unwrap() {
        OutgoingMessage::Audio {
            ptt,
            length,
            content,
            ..
        } => {
            assert!(ptt);
            assert_eq!(length, 4);
            assert_eq!(content.as_ref(), b"OggS");
        }
        other => panic!("expected audio, got {other:?}"),
    }
}

#[test]
fn test_image_attachment_caption() {
    let attachment = SendAttachment {
        base64: "iVBORw==".to_string(),
        file_name: "holiday.photo.png".to_string(),
        mime: "image/png".to_string(),
        length: 4,
    };
    match build_outgoing("group@g.us", "", Some(&attachment)).unwrap() {
        OutgoingMessage::Image { caption, mime, .. } => {
            assert_eq!(caption, "holiday");
            assert_eq!(mime, "image/png");
        }
        other => panic!("expected image, got {other:?}"),
    }
}

#[test]
fn test_bad_base64_is_rejected() {
    let attachment = SendAttachment {
        base64: "***".to_string(),
        file_name: "x.bin".to_string(),
        mime: "application/octet-stream".to_string(),
        length: 3,
    };
    let err = build_outgoing("group@g.us", "", Some(&attachment)).unwrap_err();
    assert!(matches!(err, SendError::InvalidAttachment(_)));
}

#[test]
fn test_declared_length_with_empty_content_is_sent() {
    let attachment = SendAttachment {
        base64: String::new(),
        file_name: "empty.txt".to_string(),
        mime: "text/plain".to_string(),
        length: 3,
    };
    match build_outgoing("group@g.us", "", Some(&attachment)).unwrap() {
        OutgoingMessage::Document {
            file_name, content, ..
        } => {
            assert_eq!(file_name, "empty.txt");
            assert!(content.is_empty());
        }
        other => panic!("expected document, got {other:?}"),
    }
}
