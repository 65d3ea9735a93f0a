use serde_json::json;
use wa_gateway::types::{Attachment, Endpoint, Message, SendRequest};

#[test]
fn test_message_wire_names() {
    let message = Message {
        id: "3EB0C0FFEE".to_string(),
        timestamp: 1_700_000_000,
        controller: Endpoint {
            id: "5511999887766@s.whatsapp.net".to_string(),
            phone: "+5511999887766".to_string(),
            title: None,
        },
        reply_to: Endpoint {
            id: "5521988887777@s.whatsapp.net".to_string(),
            phone: "+5521988887777".to_string(),
            title: Some("Maria".to_string()),
        },
        participant: None,
        from_me: true,
        text: "hi".to_string(),
        attachment: Some(Attachment {
            url: "https://mmg/x".to_string(),
            b64_media_key: "AQID".to_string(),
            length: 3,
            mime: "image/png".to_string(),
        }),
    };

    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(value["message_id"], "3EB0C0FFEE");
    assert_eq!(value["replyto"]["title"], "Maria");
    assert_eq!(value["fromme"], true);
    assert!(value.get("participant").is_none());
    assert!(value["controller"].get("title").is_none());
    assert_eq!(value["attachment"]["b64_media_key"], "AQID");
}

#[test]
fn test_send_request_defaults() {
    let request: SendRequest = serde_json::from_value(json!({"recipient": "1@g.us"})).unwrap();
    assert_eq!(request.recipient, "1@g.us");
    assert!(request.text.is_empty());
    assert!(request.attachment.is_none());

    let request: SendRequest = serde_json::from_value(json!({
        "recipient": "1@g.us",
        "message": "hello",
        "attachment": {"base64": "AA==", "filename": "a.txt", "mime": "text/plain", "length": 1}
    }))
    .unwrap();
    assert_eq!(request.text, "hello");
    assert_eq!(request.attachment.unwrap().file_name, "a.txt");
}
