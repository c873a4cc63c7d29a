mod conversations;

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

use crate::error::MemoryError;

pub use conversations::{ConversationSummary, SqliteConversationStore};

/// Open (or create) the `SQLite` database and run migrations.
///
/// Enables foreign key constraints at connection level so that
/// `ON DELETE CASCADE` rules are enforced. `:memory:` opens a private in-memory
/// database on a single long-lived connection.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or migrations fail.
pub async fn open_pool(path: &str) -> Result<SqlitePool, MemoryError> {
    let in_memory = path == ":memory:";
    let url = if in_memory {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite:{path}?mode=rwc")
    };

    let mut opts = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true);
    if !in_memory {
        opts = opts
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
    }

    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?
    };

    run_migrations(&pool).await?;
    tracing::debug!(path, "sqlite pool ready");
    Ok(pool)
}

/// Run all migrations on the given pool.
///
/// # Errors
///
/// Returns an error if any migration fails.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), MemoryError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn wal_journal_mode_enabled_on_file_db() {
        let file = NamedTempFile::new().expect("tempfile");
        let path = file.path().to_str().expect("valid path");

        let pool = open_pool(path).await.expect("open_pool");

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .expect("PRAGMA query");

        assert_eq!(mode, "wal", "expected WAL journal mode, got: {mode}");
    }

    #[tokio::test]
    async fn memory_pool_has_schema() {
        let pool = open_pool(":memory:").await.unwrap();
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        for expected in [
            "chunks",
            "conversation_messages",
            "conversations",
            "embedding_jobs",
        ] {
            assert!(
                tables.iter().any(|t| t == expected),
                "missing table {expected}: {tables:?}"
            );
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = open_pool(":memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
    }
}
