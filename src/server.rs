use crate::cache::MessageCache;
use crate::config::{CacheConfig, LifecycleConfig};
use crate::db::{BotRecord, BotStore, SessionStore};
use crate::normalize::{normalize, phone_from_id};
use crate::send::SendError;
use crate::transport::{
    Connector, ErrorAction, EventHandler, InboundEvent, OutgoingMessage, Transport,
    TransportError,
};
use crate::types::{Attachment, Message};
use crate::webhook::WebhookDispatcher;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Created,
    Starting,
    Connected,
    Fetching,
    Ready,
    Unreachable,
    Restarting,
    Disconnected,
    Halting,
    Stopped,
    Critical,
    Fail,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Fetching => "fetching",
            Self::Ready => "ready",
            Self::Unreachable => "unreachable",
            Self::Restarting => "restarting",
            Self::Disconnected => "disconnected",
            Self::Halting => "halting",
            Self::Stopped => "stopped",
            Self::Critical => "critical",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("session credential rejected, the bot must be verified again")]
    Unauthorized,
    #[error("transport unreachable: {0}")]
    Unreachable(String),
    #[error("no stored session for this bot")]
    MissingSession,
    #[error("store error: {0}")]
    Store(String),
    #[error(transparent)]
    Transport(TransportError),
    #[error("server halted")]
    Halted,
}

impl StartError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<TransportError> for StartError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized => Self::Unauthorized,
            TransportError::Unreachable(reason) => Self::Unreachable(reason),
            other => Self::Transport(other),
        }
    }
}

fn store_error(err: anyhow::Error) -> StartError {
    StartError::Store(format!("{err:#}"))
}

#[derive(Clone)]
pub struct ServerDeps {
    pub connector: Arc<dyn Connector>,
    pub bots: Arc<dyn BotStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub webhook: WebhookDispatcher,
    pub lifecycle: LifecycleConfig,
    pub cache: CacheConfig,
}

pub struct BotServer {
    bot_id: String,
    number: String,
    bot: Arc<RwLock<BotRecord>>,
    deps: ServerDeps,
    lifecycle: Mutex<()>,
    halted: AtomicBool,
    transport: StdRwLock<Option<Arc<dyn Transport>>>,
    cache: MessageCache,
    status: watch::Sender<ServerStatus>,
    me: Weak<BotServer>,
}

impl BotServer {
    pub fn new(bot: BotRecord, deps: ServerDeps) -> Arc<Self> {
        let (status, _) = watch::channel(ServerStatus::Created);
        Arc::new_cyclic(|me| Self {
            bot_id: bot.id.clone(),
            number: phone_from_id(&bot.id),
            cache: MessageCache::new(deps.cache.max_messages),
            bot: Arc::new(RwLock::new(bot)),
            deps,
            lifecycle: Mutex::new(()),
            halted: AtomicBool::new(false),
            transport: StdRwLock::new(None),
            status,
            me: me.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.bot_id
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub async fn bot(&self) -> BotRecord {
        self.bot.read().await.clone()
    }

    pub async fn set_webhook(&self, url: Option<String>) {
        self.bot.write().await.webhook = url;
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, status: ServerStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::debug!(bot = %self.number, "status {previous} -> {status}");
        }
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .map(|slot| slot.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn install_transport(&self, transport: Arc<dyn Transport>) {
        let mut slot = self.transport.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(transport);
    }

    fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        let mut slot = self.transport.write().unwrap_or_else(|e| e.into_inner());
        slot.take()
    }

    async fn teardown(&self) -> Result<(), TransportError> {
        let Some(transport) = self.take_transport() else {
            return Ok(());
        };
        transport.remove_handlers().await;
        match transport.disconnect().await {
            Ok(()) | Err(TransportError::NotConnected) => Ok(()),
            Err(err) => {
                tracing::warn!(bot = %self.number, "disconnect failed: {err}");
                Err(err)
            }
        }
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<(), StartError> {
        self.halted.store(false, Ordering::SeqCst);
        self.attempt_start().await
    }

    async fn attempt_start(&self) -> Result<(), StartError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_halted() {
            return Err(StartError::Halted);
        }
        self.set_status(ServerStatus::Starting);
        let _ = self.teardown().await;

        match self.connect_and_sync().await {
            Ok(()) => {
                tracing::info!(bot = %self.number, "server ready");
                Ok(())
            }
            Err(err) => {
                let _ = self.teardown().await;
                match &err {
                    StartError::Unauthorized => {
                        tracing::warn!(bot = %self.number, "session rejected, marking bot unverified");
                        if let Err(store_err) =
                            self.deps.bots.mark_verified(&self.bot_id, false).await
                        {
                            tracing::error!(bot = %self.number, "failed to mark bot unverified: {store_err:#}");
                        }
                        self.bot.write().await.verified = false;
                        self.set_status(ServerStatus::Fail);
                    }
                    StartError::Unreachable(reason) => {
                        tracing::warn!(bot = %self.number, "transport unreachable: {reason}");
                        self.set_status(ServerStatus::Unreachable);
                    }
                    other => {
                        tracing::error!(bot = %self.number, "start failed: {other}");
                        self.set_status(ServerStatus::Fail);
                    }
                }
                Err(err)
            }
        }
    }

    async fn connect_and_sync(&self) -> Result<(), StartError> {
        let lifecycle = &self.deps.lifecycle;
        let transport = self
            .deps
            .connector
            .connect(lifecycle.connect_timeout())
            .await?;
        self.install_transport(transport.clone());

        let startup = Arc::new(StartupHandler {
            server: self.me.clone(),
            conversations: StdMutex::new(Vec::new()),
            failure: StdMutex::new(None),
        });
        transport.add_handler(startup.clone()).await;

        let credential = self
            .deps
            .sessions
            .get(&self.bot_id)
            .await
            .map_err(store_error)?
            .ok_or(StartError::MissingSession)?;
        let refreshed = transport.restore_session(credential).await?;
        self.set_status(ServerStatus::Connected);

        sleep(lifecycle.settle_delay()).await;
        self.deps
            .sessions
            .update(&self.bot_id, &refreshed)
            .await
            .map_err(store_error)?;
        transport.remove_handlers().await;

        self.set_status(ServerStatus::Fetching);
        for conversation in startup.conversations() {
            if conversation.starts_with('+') {
                continue;
            }
            if let Err(err) = transport
                .load_history(
                    &conversation,
                    lifecycle.history_count,
                    lifecycle.history_pacing(),
                    startup.clone(),
                )
                .await
            {
                tracing::warn!(bot = %self.number, %conversation, "history fetch failed: {err}");
            }
        }

        transport
            .add_handler(Arc::new(LiveHandler {
                server: self.me.clone(),
            }))
            .await;
        self.set_status(ServerStatus::Ready);
        if let Some(err) = startup.take_failure() {
            tracing::warn!(bot = %self.number, "transport error during startup: {err}, scheduling restart");
            self.schedule_restart();
        }
        Ok(())
    }

    pub async fn initialize(&self) -> Result<(), StartError> {
        self.halted.store(false, Ordering::SeqCst);
        self.start_until_ready().await
    }

    async fn start_until_ready(&self) -> Result<(), StartError> {
        let lifecycle = &self.deps.lifecycle;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let err = match self.attempt_start().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            if let Some(max) = lifecycle.max_start_attempts {
                if attempts >= max {
                    tracing::error!(bot = %self.number, attempts, "giving up on start");
                    self.set_status(ServerStatus::Critical);
                    return Err(err);
                }
            }

            tracing::info!(
                bot = %self.number,
                attempts,
                "start failed ({err}), retrying in {:?}",
                lifecycle.retry_backoff()
            );
            sleep(lifecycle.retry_backoff()).await;
            if self.is_halted() {
                return Err(StartError::Halted);
            }
        }
    }

    /// Tears the connection down and initializes again. Dropped when a
    /// start or restart is already in progress, or the server was shut down.
    pub async fn restart(&self) -> Result<(), StartError> {
        let proceed = self.status.send_if_modified(|status| {
            if matches!(
                status,
                ServerStatus::Starting
                    | ServerStatus::Restarting
                    | ServerStatus::Disconnected
                    | ServerStatus::Halting
                    | ServerStatus::Stopped
            ) {
                false
            } else {
                *status = ServerStatus::Restarting;
                true
            }
        });
        if !proceed {
            tracing::debug!(bot = %self.number, status = %self.status(), "restart suppressed");
            return Ok(());
        }

        tracing::info!(bot = %self.number, "restarting");
        {
            let _guard = self.lifecycle.lock().await;
            if self.is_halted() {
                tracing::debug!(bot = %self.number, "restart dropped after shutdown");
                return Ok(());
            }
            let _ = self.teardown().await;
            self.set_status(ServerStatus::Disconnected);
        }
        match self.start_until_ready().await {
            Err(StartError::Halted) => {
                tracing::debug!(bot = %self.number, "restart dropped after shutdown");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn shutdown(&self) -> Result<(), TransportError> {
        let _guard = self.lifecycle.lock().await;
        self.halted.store(true, Ordering::SeqCst);
        if self.status() == ServerStatus::Stopped {
            return Ok(());
        }
        self.set_status(ServerStatus::Halting);
        let result = self.teardown().await;
        self.set_status(ServerStatus::Stopped);
        tracing::info!(bot = %self.number, "server stopped");
        result
    }

    pub fn schedule_restart(&self) {
        let server = self.me.clone();
        let delay = self.deps.lifecycle.restart_delay();
        tokio::spawn(async move {
            sleep(delay).await;
            if let Some(server) = server.upgrade() {
                if let Err(err) = server.restart().await {
                    tracing::warn!(bot = %server.number, "restart failed: {err}");
                }
            }
        });
    }

    fn ready_transport(&self) -> Result<Arc<dyn Transport>, SendError> {
        if self.status() != ServerStatus::Ready {
            return Err(SendError::NotReady);
        }
        self.current_transport().ok_or(SendError::NotReady)
    }

    pub async fn send_message(&self, message: OutgoingMessage) -> Result<String, SendError> {
        let transport = self.ready_transport()?;
        Ok(transport.send(message).await?)
    }

    pub async fn download(&self, attachment: &Attachment) -> Result<Bytes, SendError> {
        let transport = self.ready_transport()?;
        Ok(transport.download(attachment).await?)
    }

    pub fn own_id(&self) -> String {
        self.current_transport()
            .and_then(|t| t.own_id())
            .unwrap_or_else(|| self.bot_id.clone())
    }

    pub fn contact_title(&self, jid: &str) -> Option<String> {
        self.current_transport().and_then(|t| t.contact_title(jid))
    }

    pub fn get_messages(&self, min_timestamp: u64) -> Vec<Message> {
        self.cache.query(min_timestamp)
    }

    pub fn append_message(&self, message: Message) {
        self.cache.insert(message.clone());
        let webhook = self.deps.webhook.clone();
        let bot = self.bot.clone();
        tokio::spawn(async move {
            webhook.post(&bot, &message).await;
        });
    }

    fn ingest(&self, event: &InboundEvent) {
        let controller = self.own_id();
        let titles = |jid: &str| self.contact_title(jid);
        match normalize(event, &controller, &titles) {
            Some(message) => self.append_message(message),
            None => {
                tracing::debug!(bot = %self.number, kind = event.kind(), "dropping event without id")
            }
        }
    }
}

struct StartupHandler {
    server: Weak<BotServer>,
    conversations: StdMutex<Vec<String>>,
    failure: StdMutex<Option<TransportError>>,
}

impl StartupHandler {
    fn conversations(&self) -> Vec<String> {
        self.conversations
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn take_failure(&self) -> Option<TransportError> {
        self.failure
            .lock()
            .map(|mut f| f.take())
            .unwrap_or_else(|e| e.into_inner().take())
    }
}

#[async_trait]
impl EventHandler for StartupHandler {
    async fn handle_event(&self, event: InboundEvent) {
        let jid = &event.info().remote_jid;
        if !jid.is_empty() {
            let mut seen = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.iter().any(|c| c == jid) {
                seen.push(jid.clone());
            }
        }
        if let Some(server) = self.server.upgrade() {
            server.ingest(&event);
        }
    }

    async fn handle_error(&self, error: TransportError) {
        tracing::debug!("error during startup: {error}");
        if error.action() == ErrorAction::Restart {
            let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
            failure.get_or_insert(error);
        }
    }
}

struct LiveHandler {
    server: Weak<BotServer>,
}

#[async_trait]
impl EventHandler for LiveHandler {
    async fn handle_event(&self, event: InboundEvent) {
        if let Some(server) = self.server.upgrade() {
            server.ingest(&event);
        }
    }

    async fn handle_error(&self, error: TransportError) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        match error.action() {
            ErrorAction::Restart => {
                tracing::warn!(bot = %server.number, "transport error: {error}, scheduling restart");
                server.schedule_restart();
            }
            ErrorAction::Ignore => {
                tracing::debug!(bot = %server.number, "ignoring transport error: {error}");
            }
            ErrorAction::Log => {
                tracing::warn!(bot = %server.number, "transport error: {error}");
            }
        }
    }
}
