pub mod cache;
pub mod config;
pub mod db;
pub mod normalize;
pub mod registry;
pub mod send;
pub mod server;
pub mod sidecar;
pub mod transport;
pub mod types;
pub mod webhook;

pub use config::Config;

use self::config::{load_config, resolve_database_url};
use self::db::{BotRecord, BotStore, SqlStore};
use self::registry::Registry;
use self::send::SendError;
use self::server::{ServerDeps, ServerStatus};
use self::sidecar::SidecarConnector;
use self::types::{Attachment, SendRequest};
use self::webhook::WebhookDispatcher;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub bots: Arc<dyn BotStore>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BotInfo {
    pub id: String,
    pub number: String,
    pub verified: String,
    pub status: String,
    pub webhook: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReceiveQuery {
    pub timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookUpdate {
    #[serde(default)]
    pub url: String,
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();

    let config = load_config();
    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let store = Arc::new(SqlStore::new(pool, db_kind));
    let deps = ServerDeps {
        connector: Arc::new(SidecarConnector::new(&config.transport)),
        bots: store.clone(),
        sessions: store.clone(),
        webhook: WebhookDispatcher::new(store.clone(), &config.webhook),
        lifecycle: config.lifecycle.clone(),
        cache: config.cache.clone(),
    };

    let state = AppState {
        config: config.clone(),
        registry: Arc::new(Registry::new(deps)),
        bots: store,
    };
    let app = router(state.clone());
    Ok((state, app))
}

pub fn router(state: AppState) -> Router {
    let bot_routes = Router::new()
        .route("/v1/bot/:token", get(bot_info))
        .route("/v1/bot/:token/send", post(send_message))
        .route("/v1/bot/:token/receive", get(receive))
        .route("/v1/bot/:token/webhook", post(update_webhook))
        .route("/v1/bot/:token/attachment", post(download_attachment))
        .route("/v1/bot/:token/toggle", post(toggle));

    let public_routes = Router::new().route("/v1/health", get(health));

    Router::new()
        .merge(bot_routes)
        .merge(public_routes)
        .with_state(state)
}

fn error_response(status: StatusCode, reason: impl ToString) -> Response {
    (status, Json(json!({"error": reason.to_string()}))).into_response()
}

fn send_error_response(err: &SendError) -> Response {
    let status = match err {
        SendError::NotReady => StatusCode::CONFLICT,
        err if err.is_validation() => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    error_response(status, err)
}

async fn bot_for_token(state: &AppState, token: &str) -> Result<BotRecord, Response> {
    match state.bots.find_by_token(token).await {
        Ok(Some(bot)) => Ok(bot),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "bot not found")),
        Err(err) => {
            error!("bot lookup failed: {err:#}");
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable"))
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn bot_info(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    let bot = match bot_for_token(&state, &token).await {
        Ok(bot) => bot,
        Err(resp) => return resp,
    };
    let status = state.registry.status(&bot.id);
    let webhook = match state.registry.get(&bot.id) {
        Some(server) => server.bot().await.webhook,
        None => bot.webhook.clone(),
    };
    Json(BotInfo {
        number: bot.number(),
        verified: if bot.verified { "verified" } else { "unverified" }.to_string(),
        status: status.to_string(),
        webhook,
        id: bot.id,
    })
    .into_response()
}

async fn send_message(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<SendRequest>,
) -> Response {
    let bot = match bot_for_token(&state, &token).await {
        Ok(bot) => bot,
        Err(resp) => return resp,
    };
    match send::send(&state.registry, &bot.id, &req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => send_error_response(&err),
    }
}

async fn receive(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<ReceiveQuery>,
) -> Response {
    let bot = match bot_for_token(&state, &token).await {
        Ok(bot) => bot,
        Err(resp) => return resp,
    };
    let server = match state.registry.get(&bot.id) {
        Some(server) if server.status() == ServerStatus::Ready => server,
        _ => return send_error_response(&SendError::NotReady),
    };
    let messages = server.get_messages(query.timestamp.unwrap_or(0));
    Json(json!({"total": messages.len(), "messages": messages})).into_response()
}

async fn update_webhook(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(update): Json<WebhookUpdate>,
) -> Response {
    let bot = match bot_for_token(&state, &token).await {
        Ok(bot) => bot,
        Err(resp) => return resp,
    };
    let url = update.url.trim().to_string();
    if let Err(err) = state.bots.update_webhook(&bot.id, &url).await {
        error!("webhook update failed: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable");
    }
    let webhook = Some(url).filter(|u| !u.is_empty());
    if let Some(server) = state.registry.get(&bot.id) {
        server.set_webhook(webhook.clone()).await;
    }
    Json(json!({"id": bot.id, "webhook": webhook})).into_response()
}

async fn download_attachment(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(attachment): Json<Attachment>,
) -> Response {
    let bot = match bot_for_token(&state, &token).await {
        Ok(bot) => bot,
        Err(resp) => return resp,
    };
    let Some(server) = state.registry.get(&bot.id) else {
        return send_error_response(&SendError::NotReady);
    };
    match server.download(&attachment).await {
        Ok(bytes) => {
            let mime = if attachment.mime.is_empty() {
                "application/octet-stream".to_string()
            } else {
                attachment.mime.clone()
            };
            ([(header::CONTENT_TYPE, mime)], bytes).into_response()
        }
        Err(err) => send_error_response(&err),
    }
}

async fn toggle(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    let bot = match bot_for_token(&state, &token).await {
        Ok(bot) => bot,
        Err(resp) => return resp,
    };
    let status = state.registry.toggle(bot).await;
    Json(json!({"status": status})).into_response()
}
