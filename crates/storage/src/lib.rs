pub mod isolation;

use chrono::{DateTime, Utc};
use sqlx::{migrate::MigrateError, postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use thiserror::Error;
use uuid::Uuid;

use tenantry_core::Tenant;

pub use isolation::{
    ensure_isolation, set_tenant_context, IsolationError, IsolationReport, TENANT_POLICY_NAME,
};

/// Top-level database handle that owns the PostgreSQL connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Establishes a new connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Builds a pool without opening connections up front.
    ///
    /// Connections are established on first use, which lets request paths that
    /// never reach the database (input validation, lock contention) run
    /// without one.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to operate on tenant rows.
    pub fn tenants(&self) -> TenantRepository {
        TenantRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to postgres: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository responsible for the `tenants` table.
///
/// Tenant rows are never hard-deleted here; the only permitted mutation of an
/// existing row's name is replacing a placeholder value.
#[derive(Clone)]
pub struct TenantRepository {
    pool: PgPool,
}

const UNIQUE_VIOLATION: &str = "23505";

impl TenantRepository {
    /// Begins a transaction on the underlying pool.
    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Fetches a tenant by primary key outside of any transaction.
    pub async fn fetch(&self, tenant_id: Uuid) -> Result<Option<Tenant>, TenantRepoError> {
        let row = sqlx::query_as::<_, TenantRow>(
            "SELECT id, name, owner_id, created_at, updated_at, isolation_enabled, isolation_setup_at \
             FROM tenants WHERE id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(TenantRow::into_domain))
    }

    /// Fetches a tenant by primary key inside a transaction, locking the row
    /// so a concurrent writer on another instance cannot race the update.
    pub async fn fetch_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
    ) -> Result<Option<Tenant>, TenantRepoError> {
        let row = sqlx::query_as::<_, TenantRow>(
            "SELECT id, name, owner_id, created_at, updated_at, isolation_enabled, isolation_setup_at \
             FROM tenants WHERE id = $1 FOR UPDATE",
        )
        .bind(tenant_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(TenantRow::into_domain))
    }

    /// Inserts a new tenant row.
    ///
    /// A primary-key conflict maps to [`TenantRepoError::Duplicate`] so
    /// callers can resolve the race by reading the winner's row.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &NewTenant<'_>,
    ) -> Result<Tenant, TenantRepoError> {
        let row = sqlx::query_as::<_, TenantRow>(
            "INSERT INTO tenants \
             (id, name, owner_id, created_at, updated_at, isolation_enabled, tenant_id) \
             VALUES ($1, $2, $3, $4, $4, FALSE, $1) \
             RETURNING id, name, owner_id, created_at, updated_at, isolation_enabled, isolation_setup_at",
        )
        .bind(record.id)
        .bind(record.name)
        .bind(record.owner_id)
        .bind(record.created_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                    TenantRepoError::Duplicate
                } else {
                    TenantRepoError::Database(sqlx::Error::Database(db_err))
                }
            }
            other => TenantRepoError::Database(other),
        })?;

        Ok(row.into_domain())
    }

    /// Replaces a placeholder display name with a caller-supplied one.
    pub async fn rename_placeholder(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        name: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<Tenant, TenantRepoError> {
        let row = sqlx::query_as::<_, TenantRow>(
            "UPDATE tenants SET name = $2, updated_at = $3 WHERE id = $1 \
             RETURNING id, name, owner_id, created_at, updated_at, isolation_enabled, isolation_setup_at",
        )
        .bind(tenant_id)
        .bind(name)
        .bind(updated_at)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(TenantRepoError::NotFound)?;

        Ok(row.into_domain())
    }

    /// Flags the tenant row as isolation-ready once policy install succeeded.
    pub async fn mark_isolation_ready(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        setup_at: DateTime<Utc>,
    ) -> Result<Tenant, TenantRepoError> {
        let row = sqlx::query_as::<_, TenantRow>(
            "UPDATE tenants \
             SET isolation_enabled = TRUE, isolation_setup_at = $2, updated_at = $2 \
             WHERE id = $1 \
             RETURNING id, name, owner_id, created_at, updated_at, isolation_enabled, isolation_setup_at",
        )
        .bind(tenant_id)
        .bind(setup_at)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(TenantRepoError::NotFound)?;

        Ok(row.into_domain())
    }
}

/// Parameters required to insert a tenant row.
pub struct NewTenant<'a> {
    pub id: Uuid,
    pub name: &'a str,
    pub owner_id: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Database representation of a tenant row.
#[derive(Debug, sqlx::FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    owner_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    isolation_enabled: bool,
    isolation_setup_at: Option<DateTime<Utc>>,
}

impl TenantRow {
    fn into_domain(self) -> Tenant {
        Tenant {
            id: self.id,
            name: self.name,
            owner_id: self.owner_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            isolation_enabled: self.isolation_enabled,
            isolation_setup_at: self.isolation_setup_at,
        }
    }
}

/// Errors that can occur while operating on tenant rows.
#[derive(Debug, Error)]
pub enum TenantRepoError {
    #[error("tenant row already exists")]
    Duplicate,
    #[error("tenant row not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    async fn setup_db() -> Database {
        let url = env::var("DATABASE_URL").expect("DATABASE_URL must be set for storage tests");
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL server via DATABASE_URL"]
    async fn insert_then_fetch_roundtrips() {
        let db = setup_db().await;
        let repo = db.tenants();
        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = repo.begin().await.expect("begin");
        let inserted = repo
            .insert(
                &mut tx,
                &NewTenant {
                    id,
                    name: "Acme Corp",
                    owner_id: Some("user-7"),
                    created_at: now,
                },
            )
            .await
            .expect("insert");
        tx.commit().await.expect("commit");

        assert_eq!(inserted.id, id);
        assert!(!inserted.isolation_enabled);

        let fetched = repo.fetch(id).await.expect("fetch").expect("present");
        assert_eq!(fetched.name, "Acme Corp");
        assert_eq!(fetched.owner_id.as_deref(), Some("user-7"));
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL server via DATABASE_URL"]
    async fn second_insert_reports_duplicate() {
        let db = setup_db().await;
        let repo = db.tenants();
        let id = Uuid::new_v4();
        let record = NewTenant {
            id,
            name: "Acme Corp",
            owner_id: None,
            created_at: Utc::now(),
        };

        let mut tx = repo.begin().await.expect("begin");
        repo.insert(&mut tx, &record).await.expect("insert");
        tx.commit().await.expect("commit");

        let mut tx = repo.begin().await.expect("begin");
        let err = repo.insert(&mut tx, &record).await.unwrap_err();
        assert!(matches!(err, TenantRepoError::Duplicate));
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL server via DATABASE_URL"]
    async fn ensure_isolation_is_idempotent() {
        let db = setup_db().await;
        let repo = db.tenants();

        let mut tx = repo.begin().await.expect("begin");
        let first = ensure_isolation(&mut tx, "tenants").await.expect("install");
        let second = ensure_isolation(&mut tx, "tenants").await.expect("reinstall");
        tx.commit().await.expect("commit");

        assert!(!second.rls_enabled_now);
        assert!(!second.policy_created_now);
        // The first call may or may not change anything depending on whether a
        // previous test run already installed the policy.
        let _ = first;
    }
}
