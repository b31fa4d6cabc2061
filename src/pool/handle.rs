//! Storage handles and the factory that opens them.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::debug;

use super::{config::PoolConfig, error::PoolError, tenant::TenantId};

/// A tenant's physical storage handle.
///
/// Owned by exactly one resident pool; operations borrow it for their
/// duration and never keep it.
#[derive(Debug)]
pub struct StorageHandle {
    db: SqlitePool,
}

impl StorageHandle {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub async fn probe(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.db).await.map(|_| ())
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.db.is_closed()
    }
}

/// Opens the storage unit belonging to one tenant.
#[async_trait]
pub trait HandleFactory: Send + Sync {
    async fn open(&self, tenant: &TenantId) -> Result<StorageHandle, PoolError>;
}

/// One SQLite database file per tenant under a shared storage root.
#[derive(Debug, Clone)]
pub struct SqliteHandleFactory {
    root: PathBuf,
    busy_timeout: Duration,
    max_connections: u32,
}

impl SqliteHandleFactory {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            root: config.storage_root.clone(),
            busy_timeout: config.busy_timeout,
            max_connections: config.max_connections.max(1),
        }
    }

    pub fn database_path(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(format!("{tenant}.db"))
    }

    fn connect_options(&self, tenant: &TenantId) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(self.database_path(tenant))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout)
    }
}

#[async_trait]
impl HandleFactory for SqliteHandleFactory {
    async fn open(&self, tenant: &TenantId) -> Result<StorageHandle, PoolError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|err| {
            PoolError::creation(
                tenant,
                format!(
                    "storage root `{}` could not be provisioned: {err}",
                    self.root.display()
                ),
            )
        })?;

        let db = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(self.connect_options(tenant))
            .await
            .map_err(|err| PoolError::creation(tenant, format!("failed to open database: {err}")))?;

        let handle = StorageHandle::new(db);
        if let Err(err) = handle.probe().await {
            handle.close().await;
            return Err(PoolError::creation(
                tenant,
                format!("initial probe failed: {err}"),
            ));
        }

        debug!(
            tenant_id = %tenant,
            path = %self.database_path(tenant).display(),
            "opened tenant storage"
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).expect("valid tenant id")
    }

    #[tokio::test]
    async fn opens_one_file_per_tenant() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = SqliteHandleFactory::new(&PoolConfig::with_storage_root(dir.path()));

        let acme = factory.open(&tenant("acme")).await.expect("acme opens");
        let other = factory.open(&tenant("other")).await.expect("other opens");

        assert!(dir.path().join("acme.db").exists());
        assert!(dir.path().join("other.db").exists());
        acme.probe().await.expect("acme probe");
        other.probe().await.expect("other probe");

        acme.close().await;
        other.close().await;
        assert!(acme.is_closed());
    }

    #[tokio::test]
    async fn unprovisionable_root_is_a_creation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("write blocker");

        let factory = SqliteHandleFactory::new(&PoolConfig::with_storage_root(&blocker));
        let err = factory
            .open(&tenant("acme"))
            .await
            .expect_err("root is a file");
        assert!(matches!(err, PoolError::Creation { .. }));
    }

    #[tokio::test]
    async fn applies_workload_pragmas() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = SqliteHandleFactory::new(&PoolConfig::with_storage_root(dir.path()));
        let handle = factory.open(&tenant("acme")).await.expect("opens");

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(handle.db())
            .await
            .expect("journal mode");
        assert_eq!(mode.to_lowercase(), "wal");

        let (fk,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(handle.db())
            .await
            .expect("foreign keys");
        assert_eq!(fk, 1);

        handle.close().await;
    }
}
