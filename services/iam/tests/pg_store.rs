#![cfg(feature = "pg-tests")]

use chrono::{Duration, SubsecRound, Utc};
use iam::config::PostgresConfig;
use iam::store::postgres::PostgresStore;
use iam::store::{AuditContext, CredentialStore, NewSession, NewUser, StoreError};
use sqlx::postgres::PgPoolOptions;

fn database_url() -> Option<String> {
    std::env::var("IAM_TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
}

async fn reset_postgres(url: &str) -> Result<(), sqlx::Error> {
    let pool = match tokio::time::timeout(
        std::time::Duration::from_secs(2),
        PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(2))
            .connect(url),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(sqlx::Error::PoolTimedOut),
    };
    let exists: bool = sqlx::query_scalar("SELECT to_regclass('t_user') IS NOT NULL")
        .fetch_one(&pool)
        .await?;
    if exists {
        sqlx::query("TRUNCATE t_outgoing_message, t_session, t_user RESTART IDENTITY CASCADE")
            .execute(&pool)
            .await?;
    }
    Ok(())
}

async fn pg_store() -> Option<PostgresStore> {
    let Some(url) = database_url() else {
        eprintln!("skipping pg-tests: set IAM_TEST_DATABASE_URL or DATABASE_URL");
        return None;
    };
    if let Err(err) = reset_postgres(&url).await {
        eprintln!("skipping pg-tests: cannot connect to postgres: {err}");
        return None;
    }
    let pg = PostgresConfig {
        url,
        max_connections: 5,
        acquire_timeout_ms: 5_000,
        application_name: "iam-pg-tests".to_string(),
        min_migration: Some(1),
    };
    Some(PostgresStore::connect(&pg).await.expect("connect postgres"))
}

fn session_for(username: &str) -> NewSession {
    let now = Utc::now().trunc_subsecs(0);
    NewSession {
        username: username.to_string(),
        user_agent: "pg-test".to_string(),
        login_ip: "192.0.2.10".to_string(),
        login_location: "unknown".to_string(),
        created_at: now,
        expires_at: now + Duration::hours(1),
    }
}

// One test so the shared database is not truncated under a concurrent one.
#[tokio::test]
async fn postgres_store_lifecycle() {
    let Some(store) = pg_store().await else {
        return;
    };
    store.health_check().await.expect("health");
    assert!(store.is_durable());

    let registrar = AuditContext::new(Some("req-pg-register".into()), Some("admin-1".into()));
    let user_id = store
        .create_user(
            NewUser {
                display_name: "Alice Liddell".to_string(),
                username: "alice".to_string(),
                password_hash: "$2b$04$placeholderplaceholderplaceholderplaceholde".to_string(),
            },
            &registrar,
        )
        .await
        .expect("create user");
    let duplicate = store
        .create_user(
            NewUser {
                display_name: "Alice Again".to_string(),
                username: "alice".to_string(),
                password_hash: "x".to_string(),
            },
            &registrar,
        )
        .await;
    assert!(matches!(duplicate, Err(StoreError::Conflict(_))));

    let mut tx = store
        .begin(&AuditContext::for_request(Some("req-pg-1")))
        .await
        .expect("begin");
    let hash = tx.get_password_hash("alice").await.expect("hash");
    assert!(hash.starts_with("$2b$"));
    assert!(matches!(
        tx.get_password_hash("nobody").await,
        Err(StoreError::NotFound(_))
    ));
    let record = tx.create_session(session_for("alice")).await.expect("session");
    assert_eq!(record.user_id, user_id);
    assert_eq!(record.display_name, "Alice Liddell");
    tx.commit().await.expect("commit");

    // Dropped without commit: no row survives.
    {
        let mut tx = store.begin(&AuditContext::default()).await.expect("begin");
        tx.create_session(session_for("alice")).await.expect("session");
    }

    let logout = AuditContext::new(Some("req-pg-logout".into()), Some(user_id.clone()));
    store
        .drop_session(&record.session_id, &logout)
        .await
        .expect("drop session");
    store
        .drop_session(&record.session_id, &logout)
        .await
        .expect("drop session twice");
    store
        .drop_session("not-a-uuid", &logout)
        .await
        .expect("ignored");

    let url = database_url().expect("url");
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("pool");
    let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t_session")
        .fetch_one(&pool)
        .await
        .expect("count sessions");
    assert_eq!(sessions, 1);
    let events: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT event, request_id, user_id FROM t_outgoing_message ORDER BY id",
    )
    .fetch_all(&pool)
    .await
    .expect("events");
    let tag = |request_id: &str, user_id: Option<&str>| {
        (Some(request_id.to_string()), user_id.map(str::to_string))
    };
    let events: Vec<(String, (Option<String>, Option<String>))> = events
        .into_iter()
        .map(|(event, request_id, user_id)| (event, (request_id, user_id)))
        .collect();
    assert_eq!(
        events,
        vec![
            ("USER_CREATED".to_string(), tag("req-pg-register", Some("admin-1"))),
            ("SESSION_CREATED".to_string(), tag("req-pg-1", None)),
            (
                "SESSION_REVOKED".to_string(),
                tag("req-pg-logout", Some(user_id.as_str()))
            ),
        ]
    );
}
