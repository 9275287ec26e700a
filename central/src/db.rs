use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Default cool-down between retries for non-administrative callers.
pub const DEFAULT_RETRY_COOLDOWN: Duration = Duration::from_secs(60);

/// Puts every pooled connection into WAL mode so reads can proceed while the
/// single writer holds the process-wide lock.
#[derive(Debug, Clone, Copy)]
struct WalSetup;

impl CustomizeConnection<SqliteConnection, r2d2::Error> for WalSetup {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; \
             PRAGMA busy_timeout = 10000; \
             PRAGMA foreign_keys = ON;",
        )
        .map_err(r2d2::Error::QueryError)
    }
}

pub fn init_pool(database_url: &str) -> DbPool {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = r2d2::Pool::builder()
        .connection_customizer(Box::new(WalSetup))
        .build(manager)
        .expect("Failed to create database pool");

    // Run pending migrations automatically
    let mut conn = pool.get().expect("Failed to get database connection");
    conn.run_pending_migrations(MIGRATIONS)
        .expect("Failed to run database migrations");

    log::info!("Database migrations completed successfully");

    pool
}

/// How a storage operation behaves when the store is temporarily broken.
///
/// Administrative callers fail fast so the error reaches the operator;
/// ingestion and automation callers log, sleep the cool-down and retry the
/// same call (same arguments) until the store heals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    FailFast,
    RetryForever { cooldown: Duration },
}

impl RetryPolicy {
    /// The ingestion/automation default: never give up, never busy-loop.
    pub fn ingest() -> Self {
        RetryPolicy::RetryForever {
            cooldown: DEFAULT_RETRY_COOLDOWN,
        }
    }

    /// Whether the caller should sleep and retry, and for how long.
    pub fn backoff(&self) -> Option<Duration> {
        match self {
            RetryPolicy::FailFast => None,
            RetryPolicy::RetryForever { cooldown } => Some(*cooldown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_fast_has_no_backoff() {
        assert_eq!(RetryPolicy::FailFast.backoff(), None);
    }

    #[test]
    fn test_retry_forever_backs_off_with_cooldown() {
        let policy = RetryPolicy::RetryForever {
            cooldown: Duration::from_millis(25),
        };
        assert_eq!(policy.backoff(), Some(Duration::from_millis(25)));
    }

    #[test]
    fn test_ingest_policy_uses_default_cooldown() {
        assert_eq!(
            RetryPolicy::ingest().backoff(),
            Some(DEFAULT_RETRY_COOLDOWN)
        );
    }

    #[test]
    fn test_init_pool_applies_wal_mode() {
        use diesel::prelude::*;
        use diesel::sql_types::Text;

        #[derive(QueryableByName)]
        struct JournalMode {
            #[diesel(sql_type = Text)]
            journal_mode: String,
        }

        let path = std::env::temp_dir().join(format!("central-wal-{}.db", uuid::Uuid::new_v4()));
        let pool = init_pool(path.to_str().unwrap());
        let mut conn = pool.get().unwrap();
        let mode: JournalMode = diesel::sql_query("PRAGMA journal_mode;")
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(mode.journal_mode.to_lowercase(), "wal");

        drop(conn);
        drop(pool);
        let _ = std::fs::remove_file(&path);
    }
}
