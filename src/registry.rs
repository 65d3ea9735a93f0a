use crate::db::BotRecord;
use crate::server::{BotServer, ServerDeps, ServerStatus};
use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

pub struct Registry {
    servers: RwLock<HashMap<String, Arc<BotServer>>>,
    deps: ServerDeps,
}

impl Registry {
    pub fn new(deps: ServerDeps) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            deps,
        }
    }

    pub fn deps(&self) -> &ServerDeps {
        &self.deps
    }

    pub async fn boot(&self) -> Result<usize> {
        let bots = self
            .deps
            .bots
            .find_verified()
            .await
            .context("loading verified bots")?;
        let count = bots.len();
        for bot in bots {
            let server = self.add(bot);
            spawn_initialize(server);
        }
        tracing::info!(count, "booted bot servers");
        Ok(count)
    }

    pub fn add(&self, bot: BotRecord) -> Arc<BotServer> {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers
            .entry(bot.id.clone())
            .or_insert_with(|| BotServer::new(bot, self.deps.clone()))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<BotServer>> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = servers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.servers.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
            servers.remove(id)
        };
        match removed {
            Some(server) => {
                if let Err(err) = server.shutdown().await {
                    tracing::warn!(bot = %server.number(), "shutdown on removal failed: {err}");
                }
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: &str) -> ServerStatus {
        self.get(id)
            .map(|server| server.status())
            .unwrap_or(ServerStatus::Stopped)
    }

    pub async fn toggle(&self, bot: BotRecord) -> ServerStatus {
        let server = self.add(bot);
        match server.status() {
            ServerStatus::Stopped | ServerStatus::Created => {
                spawn_initialize(server.clone());
            }
            _ => {
                if let Err(err) = server.shutdown().await {
                    tracing::warn!(bot = %server.number(), "shutdown failed: {err}");
                }
            }
        }
        server.status()
    }

    /// QR verification of a new or re-linked account. Every QR payload is
    /// pushed to `qr`. On success the bot is persisted as verified and a fresh
    /// server is registered and initialized in the background.
    pub async fn verify(&self, user_id: &str, qr: mpsc::Sender<String>) -> Result<BotRecord> {
        let transport = self
            .deps
            .connector
            .connect(self.deps.lifecycle.connect_timeout())
            .await
            .map_err(|err| anyhow!("connecting for verification: {err}"))?;

        let login = transport.login(qr).await;
        if let Err(err) = transport.disconnect().await {
            tracing::debug!("closing verification connection: {err}");
        }
        let (wid, credential) = login.map_err(|err| anyhow!("qr login failed: {err}"))?;

        let bots = &self.deps.bots;
        bots.get_or_create(&wid, user_id).await?;
        self.deps.sessions.update(&wid, &credential).await?;
        bots.mark_verified(&wid, true).await?;
        let bot = bots
            .find_by_id(&wid)
            .await?
            .ok_or_else(|| anyhow!("bot {wid} vanished after verification"))?;

        self.remove(&wid).await;
        let server = self.add(bot.clone());
        tracing::info!(bot = %server.number(), "bot verified");
        spawn_initialize(server);
        Ok(bot)
    }

    pub async fn shutdown_all(&self) {
        let servers: Vec<Arc<BotServer>> = {
            let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
            servers.values().cloned().collect()
        };
        join_all(servers.iter().map(|server| async move {
            if let Err(err) = server.shutdown().await {
                tracing::warn!(bot = %server.number(), "shutdown failed: {err}");
            }
        }))
        .await;
    }
}

fn spawn_initialize(server: Arc<BotServer>) {
    tokio::spawn(async move {
        if let Err(err) = server.initialize().await {
            tracing::warn!(bot = %server.number(), "initialize ended: {err}");
        }
    });
}
