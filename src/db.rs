use crate::normalize::phone_from_id;
use crate::transport::SessionCredential;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql(sql: &str, kind: DbKind) -> Cow<'_, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotRecord {
    pub id: String,
    pub verified: bool,
    #[serde(skip_serializing)]
    pub token: String,
    pub user_id: String,
    pub webhook: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

impl BotRecord {
    pub fn new(id: &str, user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            verified: false,
            token: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            webhook: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn number(&self) -> String {
        phone_from_id(&self.id)
    }
}

#[async_trait]
pub trait BotStore: Send + Sync {
    async fn find_all(&self) -> Result<Vec<BotRecord>>;
    async fn find_verified(&self) -> Result<Vec<BotRecord>>;
    async fn find_by_id(&self, id: &str) -> Result<Option<BotRecord>>;
    async fn find_by_token(&self, token: &str) -> Result<Option<BotRecord>>;
    async fn get_or_create(&self, id: &str, user_id: &str) -> Result<BotRecord>;
    async fn create(&self, id: &str, user_id: &str) -> Result<BotRecord>;
    async fn mark_verified(&self, id: &str, verified: bool) -> Result<()>;
    async fn cycle_token(&self, id: &str) -> Result<String>;
    async fn update_webhook(&self, id: &str, url: &str) -> Result<()>;
    async fn resync_webhook(&self, id: &str) -> Result<Option<String>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `None` when no row exists or the row was created but never written.
    async fn get(&self, bot_id: &str) -> Result<Option<SessionCredential>>;
    async fn create(&self, bot_id: &str) -> Result<()>;
    async fn update(&self, bot_id: &str, credential: &SessionCredential) -> Result<()>;
    async fn delete(&self, bot_id: &str) -> Result<()>;
}

fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS bots (
            id TEXT PRIMARY KEY,
            is_verified INTEGER NOT NULL,
            token TEXT NOT NULL,
            user_id TEXT NOT NULL,
            webhook TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_bots_token ON bots(token)"#,
        r#"CREATE TABLE IF NOT EXISTS session_store (
            bot_id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

#[derive(Clone)]
pub struct SqlStore {
    pool: AnyPool,
    kind: DbKind,
}

const BOT_COLUMNS: &str = "id, is_verified, token, user_id, webhook, created_at, updated_at";

impl SqlStore {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    fn bot_from_row(row: &AnyRow) -> Result<BotRecord> {
        let is_verified: i64 = row.try_get("is_verified")?;
        let created_at: i64 = row.try_get("created_at")?;
        let updated_at: i64 = row.try_get("updated_at")?;
        Ok(BotRecord {
            id: row.try_get("id")?,
            verified: is_verified != 0,
            token: row.try_get("token")?,
            user_id: row.try_get("user_id")?,
            webhook: row.try_get("webhook")?,
            created_at: i64_to_datetime(created_at),
            updated_at: i64_to_datetime(updated_at),
        })
    }

    async fn select_bots(&self, filter: &str, arg: Option<&str>) -> Result<Vec<BotRecord>> {
        let raw = format!("SELECT {BOT_COLUMNS} FROM bots {filter} ORDER BY created_at");
        let sql = rewrite_sql(&raw, self.kind);
        let mut query = sqlx::query(sql.as_ref());
        if let Some(arg) = arg {
            query = query.bind(arg.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::bot_from_row).collect()
    }

    async fn touch(&self, sql: &str, id: &str, value: Option<String>) -> Result<u64> {
        let sql = rewrite_sql(sql, self.kind);
        let mut query = sqlx::query(sql.as_ref());
        if let Some(value) = value {
            query = query.bind(value);
        }
        let done = query
            .bind(Utc::now().timestamp())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl BotStore for SqlStore {
    async fn find_all(&self) -> Result<Vec<BotRecord>> {
        self.select_bots("", None).await
    }

    async fn find_verified(&self) -> Result<Vec<BotRecord>> {
        self.select_bots("WHERE is_verified = 1", None).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<BotRecord>> {
        Ok(self.select_bots("WHERE id = ?", Some(id)).await?.into_iter().next())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<BotRecord>> {
        Ok(self
            .select_bots("WHERE token = ?", Some(token))
            .await?
            .into_iter()
            .next())
    }

    async fn get_or_create(&self, id: &str, user_id: &str) -> Result<BotRecord> {
        match self.find_by_id(id).await? {
            Some(bot) => Ok(bot),
            None => BotStore::create(self, id, user_id).await,
        }
    }

    async fn create(&self, id: &str, user_id: &str) -> Result<BotRecord> {
        let record = BotRecord::new(id, user_id);
        let sql = rewrite_sql(
            &format!("INSERT INTO bots ({BOT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            self.kind,
        )
        .into_owned();
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(record.verified as i64)
            .bind(&record.token)
            .bind(&record.user_id)
            .bind(record.webhook.clone())
            .bind(record.created_at.timestamp())
            .bind(record.updated_at.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(record)
    }

    async fn mark_verified(&self, id: &str, verified: bool) -> Result<()> {
        let sql = format!(
            "UPDATE bots SET is_verified = {}, updated_at = ? WHERE id = ?",
            verified as i64
        );
        self.touch(&sql, id, None).await?;
        Ok(())
    }

    async fn cycle_token(&self, id: &str) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        let affected = self
            .touch(
                "UPDATE bots SET token = ?, updated_at = ? WHERE id = ?",
                id,
                Some(token.clone()),
            )
            .await?;
        if affected == 0 {
            return Err(anyhow!("bot {id} not found"));
        }
        Ok(token)
    }

    async fn update_webhook(&self, id: &str, url: &str) -> Result<()> {
        self.touch(
            "UPDATE bots SET webhook = ?, updated_at = ? WHERE id = ?",
            id,
            Some(url.to_string()),
        )
        .await?;
        Ok(())
    }

    async fn resync_webhook(&self, id: &str) -> Result<Option<String>> {
        let bot = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("bot {id} not found"))?;
        Ok(bot.webhook.filter(|url| !url.trim().is_empty()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let sql = rewrite_sql("DELETE FROM bots WHERE id = ?", self.kind);
        sqlx::query(sql.as_ref())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqlStore {
    async fn get(&self, bot_id: &str) -> Result<Option<SessionCredential>> {
        let sql = rewrite_sql("SELECT data FROM session_store WHERE bot_id = ?", self.kind);
        let row = sqlx::query(sql.as_ref())
            .bind(bot_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let data: String = row.try_get("data")?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(SessionCredential::decode(&data)?))
    }

    async fn create(&self, bot_id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let sql = rewrite_sql(
            r#"INSERT INTO session_store (bot_id, data, created_at, updated_at)
               VALUES (?, '', ?, ?)
               ON CONFLICT(bot_id) DO NOTHING"#,
            self.kind,
        );
        sqlx::query(sql.as_ref())
            .bind(bot_id.to_string())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update(&self, bot_id: &str, credential: &SessionCredential) -> Result<()> {
        let now = Utc::now().timestamp();
        let sql = rewrite_sql(
            r#"INSERT INTO session_store (bot_id, data, created_at, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(bot_id) DO UPDATE SET
                   data=excluded.data,
                   updated_at=excluded.updated_at"#,
            self.kind,
        );
        sqlx::query(sql.as_ref())
            .bind(bot_id.to_string())
            .bind(credential.encode())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, bot_id: &str) -> Result<()> {
        let sql = rewrite_sql("DELETE FROM session_store WHERE bot_id = ?", self.kind);
        sqlx::query(sql.as_ref())
            .bind(bot_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
