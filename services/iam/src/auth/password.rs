//! Password hashing on the blocking pool.
//!
//! Every bcrypt call runs under `spawn_blocking`, never on an async worker.
use anyhow::Context;

/// Cheapest cost bcrypt accepts.
pub const MIN_COST: u32 = 4;
/// Most expensive cost bcrypt accepts.
pub const MAX_COST: u32 = 31;

/// Hash `password` with a fresh salt at `cost`.
pub async fn hash_password(password: String, cost: u32) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .context("password hashing task failed")?
        .context("hash password")
}

/// Constant-time check of `password` against a stored hash. An unparseable
/// hash never matches.
pub async fn verify_password(password: String, hash: String) -> bool {
    match tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await {
        Ok(Ok(matches)) => matches,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "stored password hash is unreadable");
            false
        }
        Err(err) => {
            tracing::error!(error = ?err, "password verification task failed");
            false
        }
    }
}
