use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub b64_media_key: String,
    pub length: u64,
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "message_id")]
    pub id: String,
    pub timestamp: u64,
    pub controller: Endpoint,
    #[serde(rename = "replyto")]
    pub reply_to: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<Endpoint>,
    #[serde(rename = "fromme")]
    pub from_me: bool,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendAttachment {
    #[serde(default)]
    pub base64: String,
    #[serde(default, rename = "filename")]
    pub file_name: String,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub length: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendRequest {
    pub recipient: String,
    #[serde(default, rename = "message")]
    pub text: String,
    #[serde(default)]
    pub attachment: Option<SendAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub message_id: String,
    pub chat: Endpoint,
    pub from: Endpoint,
}
