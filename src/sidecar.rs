use crate::config::TransportConfig;
use crate::transport::{
    Connector, ErrorAction, EventHandler, InboundEvent, OutgoingMessage, SessionCredential, Transport,
    TransportError,
};
use crate::types::Attachment;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(1);
const HANDLER_WAIT: Duration = Duration::from_millis(20);

type Handlers = Arc<RwLock<Vec<Arc<dyn EventHandler>>>>;

#[derive(Clone)]
pub struct SidecarConnector {
    base_url: String,
    poll_timeout: Duration,
}

impl SidecarConnector {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            base_url: config.sidecar_url.trim_end_matches('/').to_string(),
            poll_timeout: config.poll_timeout(),
        }
    }
}

#[async_trait]
impl Connector for SidecarConnector {
    async fn connect(&self, timeout: Duration) -> Result<Arc<dyn Transport>, TransportError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|err| TransportError::Other(err.to_string()))?;
        let resp = client
            .get(format!("{}/health", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(request_error)?;
        if !resp.status().is_success() {
            return Err(TransportError::Unreachable(format!(
                "sidecar health returned {}",
                resp.status()
            )));
        }
        Ok(Arc::new(SidecarTransport {
            client,
            base_url: self.base_url.clone(),
            poll_timeout: self.poll_timeout,
            wid: StdRwLock::new(None),
            contacts: StdRwLock::new(HashMap::new()),
            handlers: Arc::new(RwLock::new(Vec::new())),
            reader: StdMutex::new(None),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct LoginStarted {
    login_id: String,
    #[serde(default)]
    qr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoginState {
    #[serde(default)]
    qr: Option<String>,
    #[serde(default)]
    wid: Option<String>,
    #[serde(default)]
    credential: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Contact {
    jid: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Restored {
    wid: String,
    credential: String,
    #[serde(default)]
    contacts: Vec<Contact>,
}

#[derive(Debug, Deserialize)]
struct Sent {
    message_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct EventBatch {
    #[serde(default)]
    events: Vec<PolledItem>,
}

#[derive(Debug, Deserialize)]
struct PolledItem {
    offset: u64,
    #[serde(default)]
    event: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct History {
    #[serde(default)]
    events: Vec<Value>,
}

pub struct SidecarTransport {
    client: Client,
    base_url: String,
    poll_timeout: Duration,
    wid: StdRwLock<Option<String>>,
    contacts: StdRwLock<HashMap<String, String>>,
    handlers: Handlers,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl SidecarTransport {
    fn session_url(&self, suffix: &str) -> Result<String, TransportError> {
        let wid = self.own_id().ok_or(TransportError::NotConnected)?;
        Ok(session_url(&self.base_url, &wid, suffix))
    }

    fn stop_reader(&self) {
        let handle = self
            .reader
            .lock()
            .map(|mut r| r.take())
            .unwrap_or_else(|e| e.into_inner().take());
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn start_reader(&self, wid: &str) {
        self.stop_reader();
        let handle = tokio::spawn(read_events(
            self.client.clone(),
            session_url(&self.base_url, wid, "events"),
            self.poll_timeout,
            self.handlers.clone(),
        ));
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        *reader = Some(handle);
    }
}

impl Drop for SidecarTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

fn session_url(base_url: &str, wid: &str, suffix: &str) -> String {
    format!(
        "{}/v1/sessions/{}/{}",
        base_url,
        utf8_percent_encode(wid, NON_ALPHANUMERIC),
        suffix
    )
}

fn request_error(err: reqwest::Error) -> TransportError {
    if err.is_connect() || err.is_timeout() {
        TransportError::Unreachable(err.to_string())
    } else {
        TransportError::ConnectionFailed(err.to_string())
    }
}

async fn status_error(resp: Response) -> TransportError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => TransportError::Unauthorized,
        StatusCode::CONFLICT => TransportError::NotConnected,
        _ => match TransportError::from_signature(&body) {
            TransportError::Other(_) => {
                TransportError::Other(format!("sidecar returned {status}: {body}"))
            }
            err => err,
        },
    }
}

async fn checked(resp: Response) -> Result<Response, TransportError> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(status_error(resp).await)
    }
}

async fn json_body<T: for<'de> Deserialize<'de>>(resp: Response) -> Result<T, TransportError> {
    checked(resp)
        .await?
        .json::<T>()
        .await
        .map_err(|err| TransportError::InvalidData(err.to_string()))
}

fn parse_event(raw: Value) -> Result<InboundEvent, TransportError> {
    let kind = raw
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    serde_json::from_value(raw).map_err(|_| TransportError::NotImplemented(kind))
}

async fn dispatch(handlers: &Handlers, item: &Result<InboundEvent, TransportError>) -> bool {
    let snapshot = handlers.read().await.clone();
    for handler in &snapshot {
        match item {
            Ok(event) => handler.handle_event(event.clone()).await,
            Err(err) => handler.handle_error(err.clone()).await,
        }
    }
    !snapshot.is_empty()
}

// Session-ending poll errors stop the reader; the server restarts it.
fn ends_reader(err: &TransportError) -> bool {
    err.action() == ErrorAction::Restart
        || matches!(err, TransportError::Unauthorized | TransportError::NotConnected)
}

/// Long-poll loop of one session. Nothing is polled while no handler is
/// attached, and the offset only moves past items some handler received.
async fn read_events(client: Client, url: String, poll_timeout: Duration, handlers: Handlers) {
    let mut offset: u64 = 0;
    loop {
        if handlers.read().await.is_empty() {
            sleep(HANDLER_WAIT).await;
            continue;
        }
        let resp = client
            .get(&url)
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", poll_timeout.as_secs().to_string()),
            ])
            .timeout(poll_timeout + Duration::from_secs(10))
            .send()
            .await;
        let batch = match resp {
            Ok(resp) => json_body::<EventBatch>(resp).await,
            Err(err) if err.is_timeout() => continue,
            Err(err) => Err(TransportError::ConnectionFailed(err.to_string())),
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(err) if ends_reader(&err) => {
                let item = Err(err);
                while !dispatch(&handlers, &item).await {
                    sleep(HANDLER_WAIT).await;
                }
                return;
            }
            Err(err) => {
                dispatch(&handlers, &Err(err)).await;
                sleep(POLL_ERROR_PAUSE).await;
                continue;
            }
        };
        for item in batch.events {
            let delivered = if let Some(error) = item.error {
                dispatch(&handlers, &Err(TransportError::from_signature(&error))).await
            } else if let Some(raw) = item.event {
                dispatch(&handlers, &parse_event(raw)).await
            } else {
                true
            };
            if !delivered {
                break;
            }
            offset = offset.max(item.offset + 1);
        }
    }
}

fn outgoing_body(message: &OutgoingMessage) -> Value {
    match message {
        OutgoingMessage::Text { to, text } => json!({"type": "text", "to": to, "text": text}),
        OutgoingMessage::Audio {
            to,
            mime,
            length,
            ptt,
            content,
        } => json!({
            "type": "audio",
            "to": to,
            "mime": mime,
            "length": length,
            "ptt": ptt,
            "content": STANDARD.encode(content),
        }),
        OutgoingMessage::Image {
            to,
            caption,
            mime,
            content,
        } => json!({
            "type": "image",
            "to": to,
            "caption": caption,
            "mime": mime,
            "content": STANDARD.encode(content),
        }),
        OutgoingMessage::Document {
            to,
            title,
            file_name,
            mime,
            content,
        } => json!({
            "type": "document",
            "to": to,
            "title": title,
            "file_name": file_name,
            "mime": mime,
            "content": STANDARD.encode(content),
        }),
    }
}

#[async_trait]
impl Transport for SidecarTransport {
    fn own_id(&self) -> Option<String> {
        self.wid.read().ok().and_then(|w| w.clone())
    }

    fn contact_title(&self, jid: &str) -> Option<String> {
        self.contacts.read().ok().and_then(|c| c.get(jid).cloned())
    }

    async fn login(
        &self,
        qr: mpsc::Sender<String>,
    ) -> Result<(String, SessionCredential), TransportError> {
        let resp = self
            .client
            .post(format!("{}/v1/login", self.base_url))
            .send()
            .await
            .map_err(request_error)?;
        let started: LoginStarted = json_body(resp).await?;
        let mut last_qr = started.qr.clone();
        if let Some(code) = started.qr {
            if qr.send(code).await.is_err() {
                return Err(TransportError::Other("verification cancelled".into()));
            }
        }

        let url = format!(
            "{}/v1/login/{}",
            self.base_url,
            utf8_percent_encode(&started.login_id, NON_ALPHANUMERIC)
        );
        loop {
            let resp = self.client.get(&url).send().await.map_err(request_error)?;
            let state: LoginState = json_body(resp).await?;
            if let Some(error) = state.error {
                return Err(TransportError::from_signature(&error));
            }
            if let (Some(wid), Some(credential)) = (state.wid, state.credential) {
                let credential = SessionCredential::decode(&credential)
                    .map_err(|err| TransportError::InvalidData(err.to_string()))?;
                if let Ok(mut slot) = self.wid.write() {
                    *slot = Some(wid.clone());
                }
                return Ok((wid, credential));
            }
            if state.qr.is_some() && state.qr != last_qr {
                last_qr = state.qr.clone();
                if let Some(code) = state.qr {
                    if qr.send(code).await.is_err() {
                        return Err(TransportError::Other("verification cancelled".into()));
                    }
                }
            }
            sleep(LOGIN_POLL_INTERVAL).await;
        }
    }

    async fn restore_session(
        &self,
        credential: SessionCredential,
    ) -> Result<SessionCredential, TransportError> {
        let resp = self
            .client
            .post(format!("{}/v1/sessions/restore", self.base_url))
            .json(&json!({ "credential": credential.encode() }))
            .send()
            .await
            .map_err(request_error)?;
        let restored: Restored = json_body(resp).await?;
        let refreshed = SessionCredential::decode(&restored.credential)
            .map_err(|err| TransportError::InvalidData(err.to_string()))?;

        if let Ok(mut contacts) = self.contacts.write() {
            for contact in restored.contacts {
                if let Some(name) = contact.name.filter(|n| !n.is_empty()) {
                    contacts.insert(contact.jid, name);
                }
            }
        }
        if let Ok(mut slot) = self.wid.write() {
            *slot = Some(restored.wid.clone());
        }
        self.start_reader(&restored.wid);
        Ok(refreshed)
    }

    async fn send(&self, message: OutgoingMessage) -> Result<String, TransportError> {
        let resp = self
            .client
            .post(self.session_url("send")?)
            .json(&outgoing_body(&message))
            .send()
            .await
            .map_err(request_error)?;
        let sent: Sent = json_body(resp).await?;
        Ok(sent.message_id)
    }

    async fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    async fn remove_handlers(&self) {
        self.handlers.write().await.clear();
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stop_reader();
        let url = self.session_url("disconnect")?;
        let resp = self
            .client
            .post(url)
            .send()
            .await
            .map_err(request_error)?;
        checked(resp).await?;
        if let Ok(mut slot) = self.wid.write() {
            *slot = None;
        }
        Ok(())
    }

    async fn load_history(
        &self,
        conversation: &str,
        count: usize,
        pacing: Duration,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), TransportError> {
        let resp = self
            .client
            .get(self.session_url("history")?)
            .query(&[("chat", conversation.to_string()), ("count", count.to_string())])
            .send()
            .await
            .map_err(request_error);
        let history: Result<History, TransportError> = match resp {
            Ok(resp) => json_body(resp).await,
            Err(err) => Err(err),
        };
        sleep(pacing).await;
        for raw in history?.events {
            match parse_event(raw) {
                Ok(event) => handler.handle_event(event).await,
                Err(err) => handler.handle_error(err).await,
            }
        }
        Ok(())
    }

    async fn download(&self, attachment: &Attachment) -> Result<Bytes, TransportError> {
        let resp = self
            .client
            .post(self.session_url("media")?)
            .json(attachment)
            .send()
            .await
            .map_err(request_error)?;
        checked(resp)
            .await?
            .bytes()
            .await
            .map_err(|err| TransportError::ConnectionFailed(err.to_string()))
    }
}
