#[path = "../support/mod.rs"]
mod support;

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{fast_lifecycle, MemoryStore};
use tokio::sync::mpsc;
use wa_gateway::config::{CacheConfig, TransportConfig, WebhookConfig};
use wa_gateway::server::{BotServer, ServerDeps, ServerStatus};
use wa_gateway::sidecar::SidecarConnector;
use wa_gateway::transport::{
    Connector, EventHandler, InboundEvent, OutgoingMessage, SessionCredential, Transport,
    TransportError,
};
use wa_gateway::types::Attachment;
use wa_gateway::webhook::WebhookDispatcher;
use wiremock::matchers::{body_partial_json, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WID: &str = "5511999887766@s.whatsapp.net";

#[derive(Default)]
struct Collector {
    events: Mutex<Vec<InboundEvent>>,
    errors: Mutex<Vec<TransportError>>,
}

#[async_trait]
impl EventHandler for Collector {
    async fn handle_event(&self, event: InboundEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn handle_error(&self, error: TransportError) {
        self.errors.lock().unwrap().push(error);
    }
}

fn connector_for(server: &MockServer) -> SidecarConnector {
    SidecarConnector::new(&TransportConfig {
        sidecar_url: server.uri(),
        poll_timeout_seconds: 1,
    })
}

async fn healthy_sidecar() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;
    server
}

async fn logged_in(server: &MockServer) -> Arc<dyn Transport> {
    Mock::given(method("POST"))
        .and(path("/v1/login"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"login_id": "L1", "qr": "qr-1"})),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/login/L1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "wid": WID,
            "credential": SessionCredential::from_bytes(b"cred".to_vec()).encode(),
        })))
        .mount(server)
        .await;

    let transport = connector_for(server)
        .connect(Duration::from_secs(2))
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(4);
    let (wid, credential) = transport.login(tx).await.unwrap();
    assert_eq!(wid, WID);
    assert_eq!(credential.as_bytes(), b"cred");
    assert_eq!(rx.recv().await.as_deref(), Some("qr-1"));
    transport
}

#[tokio::test]
async fn test_connect_to_missing_sidecar_is_unreachable() {
    let connector = SidecarConnector::new(&TransportConfig {
        sidecar_url: "http://127.0.0.1:1".to_string(),
        poll_timeout_seconds: 1,
    });
    let err = connector.connect(Duration::from_secs(1)).await.err().unwrap();
    assert!(matches!(err, TransportError::Unreachable(_)));
}

#[tokio::test]
async fn test_restore_session_and_read_events() {
    let server = healthy_sidecar().await;
    Mock::given(method("POST"))
        .and(path("/v1/sessions/restore"))
        .and(body_partial_json(json!({"credential": "c3RvcmVk"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "wid": WID,
            "credential": "cmVmcmVzaGVk",
            "contacts": [{"jid": "5521988887777@s.whatsapp.net", "name": "Maria"}],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1/sessions/.+/events$"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [
                {"offset": 0, "event": {
                    "type": "text",
                    "info": {"id": "M1", "remote_jid": "5521988887777@s.whatsapp.net", "timestamp": 5},
                    "text": "hello"
                }},
                {"offset": 1, "event": {"type": "poll", "info": {"id": "M2", "remote_jid": "x"}}},
                {"offset": 2, "error": "websocket: close 1006 (abnormal closure) code: 1006"}
            ]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1/sessions/.+/events$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"events": []}))
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&server)
        .await;

    let transport = connector_for(&server)
        .connect(Duration::from_secs(2))
        .await
        .unwrap();
    let collector = Arc::new(Collector::default());
    transport.add_handler(collector.clone()).await;

    let refreshed = transport
        .restore_session(SessionCredential::from_bytes(b"stored".to_vec()))
        .await
        .unwrap();
    assert_eq!(refreshed.as_bytes(), b"refreshed");
    assert_eq!(transport.own_id().as_deref(), Some(WID));
    assert_eq!(
        transport.contact_title("5521988887777@s.whatsapp.net").as_deref(),
        Some("Maria")
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        while collector.errors.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let events = collector.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].info().id, "M1");
    let errors = collector.errors.lock().unwrap().clone();
    assert_eq!(errors[0], TransportError::NotImplemented("poll".to_string()));
    assert_eq!(errors[1], TransportError::Closed(1006));
}

#[tokio::test]
async fn test_restore_rejected_is_unauthorized() {
    let server = healthy_sidecar().await;
    Mock::given(method("POST"))
        .and(path("/v1/sessions/restore"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let transport = connector_for(&server)
        .connect(Duration::from_secs(2))
        .await
        .unwrap();
    let err = transport
        .restore_session(SessionCredential::from_bytes(b"stale".to_vec()))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Unauthorized);
}

#[tokio::test]
async fn test_send_text() {
    let server = healthy_sidecar().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/v1/sessions/.+/send$"))
        .and(body_partial_json(json!({"type": "text", "to": "group@g.us", "text": "hi"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message_id": "3EB0AA"})))
        .expect(1)
        .mount(&server)
        .await;

    let transport = logged_in(&server).await;
    let id = transport
        .send(OutgoingMessage::Text {
            to: "group@g.us".to_string(),
            text: "hi".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(id, "3EB0AA");
}

#[tokio::test]
async fn test_send_without_session_is_not_connected() {
    let server = healthy_sidecar().await;
    let transport = connector_for(&server)
        .connect(Duration::from_secs(2))
        .await
        .unwrap();
    let err = transport
        .send(OutgoingMessage::Text {
            to: "group@g.us".to_string(),
            text: "hi".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::NotConnected);
}

#[tokio::test]
async fn test_send_failure_maps_signature() {
    let server = healthy_sidecar().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/v1/sessions/.+/send$"))
        .respond_with(ResponseTemplate::new(500).set_body_string("invalid websocket"))
        .mount(&server)
        .await;

    let transport = logged_in(&server).await;
    let err = transport
        .send(OutgoingMessage::Text {
            to: "group@g.us".to_string(),
            text: "hi".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::InvalidWebsocket);
}

#[tokio::test]
async fn test_disconnect_conflict_is_not_connected() {
    let server = healthy_sidecar().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/v1/sessions/.+/disconnect$"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let transport = logged_in(&server).await;
    assert_eq!(
        transport.disconnect().await.unwrap_err(),
        TransportError::NotConnected
    );
}

#[tokio::test]
async fn test_load_history_feeds_handler() {
    let server = healthy_sidecar().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1/sessions/.+/history$"))
        .and(query_param("chat", "5521988887777@s.whatsapp.net"))
        .and(query_param("count", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [
                {"type": "text", "info": {"id": "H1", "remote_jid": "5521988887777@s.whatsapp.net", "timestamp": 1}, "text": "a"},
                {"type": "text", "info": {"id": "H2", "remote_jid": "5521988887777@s.whatsapp.net", "timestamp": 2}, "text": "b"}
            ]
        })))
        .mount(&server)
        .await;

    let transport = logged_in(&server).await;
    let collector = Arc::new(Collector::default());
    transport
        .load_history(
            "5521988887777@s.whatsapp.net",
            50,
            Duration::from_millis(1),
            collector.clone(),
        )
        .await
        .unwrap();
    assert_eq!(collector.events.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_download_returns_bytes() {
    let server = healthy_sidecar().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/v1/sessions/.+/media$"))
        .and(body_partial_json(json!({"url": "https://mmg/x"})))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"raw-media".to_vec()))
        .mount(&server)
        .await;

    let transport = logged_in(&server).await;
    let bytes = transport
        .download(&Attachment {
            url: "https://mmg/x".to_string(),
            b64_media_key: "AQID".to_string(),
            length: 9,
            mime: "image/png".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(bytes.as_ref(), b"raw-media");
}

async fn restorable(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/sessions/restore"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "wid": WID,
            "credential": "cmVmcmVzaGVk",
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1/sessions/.+/history$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"events": []})))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/v1/sessions/.+/disconnect$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn idle_events(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1/sessions/.+/events$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"events": []}))
                .set_delay(Duration::from_millis(100)),
        )
        .mount(server)
        .await;
}

fn sidecar_bot(sidecar: &MockServer, store: &Arc<MemoryStore>, settle_delay_ms: u64) -> Arc<BotServer> {
    let mut lifecycle = fast_lifecycle();
    lifecycle.settle_delay_ms = settle_delay_ms;
    let deps = ServerDeps {
        connector: Arc::new(connector_for(sidecar)),
        bots: store.clone(),
        sessions: store.clone(),
        webhook: WebhookDispatcher::new(store.clone(), &WebhookConfig::default()),
        lifecycle,
        cache: CacheConfig::default(),
    };
    BotServer::new(store.bot(WID).unwrap(), deps)
}

async fn restore_count(sidecar: &MockServer) -> usize {
    sidecar
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/v1/sessions/restore")
        .count()
}

#[tokio::test]
async fn test_failed_poll_does_not_stop_the_reader() {
    let sidecar = healthy_sidecar().await;
    restorable(&sidecar).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1/sessions/.+/events$"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .up_to_n_times(1)
        .mount(&sidecar)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1/sessions/.+/events$"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [
                {"offset": 0, "event": {
                    "type": "text",
                    "info": {"id": "M1", "remote_jid": "5521988887777@s.whatsapp.net", "timestamp": 5},
                    "text": "after the failure"
                }}
            ]
        })))
        .up_to_n_times(1)
        .mount(&sidecar)
        .await;
    idle_events(&sidecar).await;

    let store = MemoryStore::seeded(WID);
    let server = sidecar_bot(&sidecar, &store, 10);
    server.start().await.unwrap();
    assert_eq!(server.status(), ServerStatus::Ready);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.get_messages(0).iter().any(|m| m.id == "M1") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(restore_count(&sidecar).await, 1);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_session_loss_during_startup_restarts_once_ready() {
    let sidecar = healthy_sidecar().await;
    restorable(&sidecar).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1/sessions/.+/events$"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_string("websocket: close 1006 (abnormal closure) code: 1006"),
        )
        .up_to_n_times(1)
        .mount(&sidecar)
        .await;
    idle_events(&sidecar).await;

    let store = MemoryStore::seeded(WID);
    let server = sidecar_bot(&sidecar, &store, 300);
    server.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !(restore_count(&sidecar).await >= 2 && server.status() == ServerStatus::Ready) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_events_wait_for_a_handler() {
    let sidecar = healthy_sidecar().await;
    restorable(&sidecar).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v1/sessions/.+/events$"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "events": [
                {"offset": 0, "event": {
                    "type": "text",
                    "info": {"id": "M1", "remote_jid": "5521988887777@s.whatsapp.net", "timestamp": 5},
                    "text": "hello"
                }}
            ]
        })))
        .mount(&sidecar)
        .await;
    idle_events(&sidecar).await;

    let transport = connector_for(&sidecar)
        .connect(Duration::from_secs(2))
        .await
        .unwrap();
    transport
        .restore_session(SessionCredential::from_bytes(b"stored".to_vec()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let polls = sidecar
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().ends_with("/events"))
        .count();
    assert_eq!(polls, 0);

    let collector = Arc::new(Collector::default());
    transport.add_handler(collector.clone()).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while collector.events.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(collector.events.lock().unwrap()[0].info().id, "M1");
}
