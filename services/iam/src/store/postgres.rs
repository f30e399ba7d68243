//! Postgres-backed implementation of the credential store.
//!
//! # Tables
//! - `t_user`: registered users; `active` and `deleted_at` gate authentication.
//! - `t_session`: one row per login; logout sets `deleted_at`.
//! - `t_outgoing_message`: append-only outbox written in the same transaction
//!   as the change it describes. Its `request_id` and `user_id` columns default
//!   to the transaction's audit settings.
//!
//! # Consistency
//! Every write runs in a `SERIALIZABLE` transaction whose first statements set
//! `application.request_id` and `application.user_id` with `set_config(.., TRUE)`,
//! so they vanish at commit. `sqlx` rolls a transaction back when it is dropped
//! uncommitted, so a cancelled login leaves no session row and no outbox
//! message.
//!
//! # Operational notes
//! - Embedded migrations run at connect time unless disabled.
//! - An optional minimum migration version makes startup fail against a schema
//!   that is older than this binary expects.
//! - Database URLs may contain credentials; never log them.
use super::{
    AuditContext, CredentialStore, LoginTransaction, NewSession, NewUser, OutboxMessage, SessionRecord,
    StoreError, StoreResult,
};
use crate::config::PostgresConfig;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub struct PostgresStore {
    pool: PgPool,
}

#[derive(Debug, Clone, FromRow)]
struct DbSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    user_id: Uuid,
    name: String,
    username: String,
}

impl From<DbSession> for SessionRecord {
    fn from(row: DbSession) -> Self {
        Self {
            session_id: row.id.to_string(),
            created_at: row.created_at,
            expires_at: row.expires_at,
            user_id: row.user_id.to_string(),
            display_name: row.name,
            username: row.username,
        }
    }
}

impl PostgresStore {
    /// Connect, run embedded migrations and check the minimum migration.
    pub async fn connect(pg: &PostgresConfig) -> StoreResult<Self> {
        Self::connect_internal(pg, true).await
    }

    /// Connect against a schema managed elsewhere.
    pub async fn connect_without_migrations(pg: &PostgresConfig) -> StoreResult<Self> {
        Self::connect_internal(pg, false).await
    }

    async fn connect_internal(pg: &PostgresConfig, run_migrations: bool) -> StoreResult<Self> {
        let connect_options =
            PgConnectOptions::from_str(&pg.url)?.application_name(&pg.application_name);
        let pool = PgPoolOptions::new()
            .max_connections(pg.max_connections)
            .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
            .connect_with(connect_options)
            .await?;

        if run_migrations {
            sqlx::migrate!("./migrations").run(&pool).await?;
        }
        if let Some(min_version) = pg.min_migration {
            check_min_migration(&pool, min_version).await?;
        }

        tracing::info!(
            max_connections = pg.max_connections,
            migrations = run_migrations,
            "postgres credential store ready"
        );
        Ok(Self { pool })
    }
}

/// Open a serializable transaction tagged with `audit`.
async fn begin_tagged(
    pool: &PgPool,
    audit: &AuditContext,
) -> StoreResult<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;
    for (setting, value) in [
        ("application.request_id", &audit.request_id),
        ("application.user_id", &audit.user_id),
    ] {
        if let Some(value) = value {
            sqlx::query("SELECT set_config($1, $2, TRUE)")
                .bind(setting)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
    }
    Ok(tx)
}

async fn check_min_migration(pool: &PgPool, min_version: i64) -> StoreResult<()> {
    let applied: bool = sqlx::query_scalar(
        r#"SELECT COUNT(1) > 0 FROM _sqlx_migrations WHERE version >= $1 AND success = TRUE"#,
    )
    .bind(min_version)
    .fetch_one(pool)
    .await?;
    if !applied {
        return Err(StoreError::Unexpected(anyhow!(
            "database schema is older than required migration {min_version}"
        )));
    }
    Ok(())
}

struct PgLoginTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LoginTransaction for PgLoginTransaction {
    async fn get_password_hash(&mut self, username: &str) -> StoreResult<String> {
        let hash: Option<String> = sqlx::query_scalar(
            r#"
            SELECT TU.password
            FROM t_user TU
            WHERE TU.username = $1
              AND TU.active = TRUE
              AND TU.deleted_at IS NULL
            "#,
        )
        .bind(username)
        .fetch_optional(&mut *self.tx)
        .await?;
        hash.ok_or_else(|| StoreError::NotFound("user".into()))
    }

    async fn create_session(&mut self, session: NewSession) -> StoreResult<SessionRecord> {
        let row: Option<DbSession> = sqlx::query_as(
            r#"
            WITH inserted AS (
                INSERT INTO t_session (user_id, user_agent, login_ip, login_location, created_at, expires_at)
                SELECT TU.id, $2, $3::TEXT::INET, $4, $5, $6
                FROM t_user TU
                WHERE TU.username = $1
                  AND TU.active = TRUE
                  AND TU.deleted_at IS NULL
                RETURNING id, created_at, expires_at, user_id
            )
            SELECT I.id, I.created_at, I.expires_at, I.user_id, TU.name, TU.username
            FROM inserted I
            JOIN t_user TU ON TU.id = I.user_id
            "#,
        )
        .bind(&session.username)
        .bind(&session.user_agent)
        .bind(&session.login_ip)
        .bind(&session.login_location)
        .bind(session.created_at)
        .bind(session.expires_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        let record: SessionRecord = row
            .ok_or_else(|| StoreError::NotFound("user".into()))?
            .into();

        insert_outbox(&mut self.tx, &OutboxMessage::session_created(&record)).await?;
        Ok(record)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

async fn insert_outbox(
    tx: &mut Transaction<'static, Postgres>,
    message: &OutboxMessage,
) -> StoreResult<()> {
    sqlx::query(r#"INSERT INTO t_outgoing_message (event, queue, payload) VALUES ($1, $2, $3)"#)
        .bind(&message.event)
        .bind(&message.queue)
        .bind(&message.payload)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl CredentialStore for PostgresStore {
    async fn begin(&self, audit: &AuditContext) -> StoreResult<Box<dyn LoginTransaction>> {
        let tx = begin_tagged(&self.pool, audit).await?;
        Ok(Box::new(PgLoginTransaction { tx }))
    }

    async fn create_user(&self, user: NewUser, audit: &AuditContext) -> StoreResult<String> {
        let mut tx = begin_tagged(&self.pool, audit).await?;
        let insert: Result<Uuid, sqlx::Error> = sqlx::query_scalar(
            r#"INSERT INTO t_user (name, username, password) VALUES ($1, $2, $3) RETURNING id"#,
        )
        .bind(&user.display_name)
        .bind(&user.username)
        .bind(&user.password_hash)
        .fetch_one(&mut *tx)
        .await;
        let id = match insert {
            Ok(id) => id.to_string(),
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::Conflict("username taken".into()));
            }
            Err(err) => return Err(err.into()),
        };

        insert_outbox(&mut tx, &OutboxMessage::user_created(&id, &user)).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn drop_session(&self, session_id: &str, audit: &AuditContext) -> StoreResult<()> {
        // Session ids are always UUIDs here; anything else cannot match a row.
        let Ok(id) = Uuid::parse_str(session_id) else {
            return Ok(());
        };
        let mut tx = begin_tagged(&self.pool, audit).await?;
        let result = sqlx::query(
            r#"UPDATE t_session SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL"#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() > 0 {
            insert_outbox(&mut tx, &OutboxMessage::session_revoked(session_id)).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}
