use sqlx::{Postgres, Row, Transaction};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Name of the row-level security policy installed on tenant-scoped tables.
pub const TENANT_POLICY_NAME: &str = "tenant_isolation";

/// Predicate restricting visible and writable rows to the caller's tenant
/// context, with an explicit allowance for legacy rows whose tenant column is
/// null. The same expression guards reads and writes, and downstream
/// consumers depend on its exact shape.
pub const TENANT_PREDICATE: &str = "tenant_id = current_tenant_context() \
     OR id = current_tenant_context() \
     OR tenant_id IS NULL";

/// What [`ensure_isolation`] actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsolationReport {
    pub rls_enabled_now: bool,
    pub policy_created_now: bool,
}

impl IsolationReport {
    pub fn changed(self) -> bool {
        self.rls_enabled_now || self.policy_created_now
    }
}

/// Errors produced while installing the isolation policy.
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("invalid table name: {0}")]
    InvalidTableName(String),
    #[error("table does not exist: {0}")]
    UnknownTable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Idempotently enables row-level security and installs the tenant isolation
/// policy on the given table.
///
/// Both steps are read-before-write, so concurrent provisioning attempts that
/// reach this after the first installation are safe no-ops.
pub async fn ensure_isolation(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
) -> Result<IsolationReport, IsolationError> {
    if !is_valid_identifier(table) {
        return Err(IsolationError::InvalidTableName(table.to_string()));
    }

    let mut report = IsolationReport::default();

    let row = sqlx::query("SELECT relrowsecurity FROM pg_class WHERE oid = to_regclass($1)")
        .bind(table)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else {
        return Err(IsolationError::UnknownTable(table.to_string()));
    };

    let rls_enabled: bool = row.get("relrowsecurity");
    if !rls_enabled {
        sqlx::query(&enable_rls_sql(table)).execute(&mut **tx).await?;
        report.rls_enabled_now = true;
    }

    let existing = sqlx::query(
        "SELECT 1 FROM pg_policies \
         WHERE schemaname = current_schema() AND tablename = $1 AND policyname = $2",
    )
    .bind(table)
    .bind(TENANT_POLICY_NAME)
    .fetch_optional(&mut **tx)
    .await?;
    if existing.is_none() {
        sqlx::query(&create_policy_sql(table))
            .execute(&mut **tx)
            .await?;
        report.policy_created_now = true;
    }

    if report.changed() {
        info!(
            stage = "isolation",
            table,
            rls_enabled = report.rls_enabled_now,
            policy_created = report.policy_created_now,
            "installed row-level isolation"
        );
    }

    Ok(report)
}

/// Sets the tenant context for the current transaction.
///
/// The isolation predicate reads this value through
/// `current_tenant_context()`; it must be set before any query that touches
/// tenant-scoped rows.
pub async fn set_tenant_context(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
) -> Result<(), IsolationError> {
    sqlx::query("SELECT set_config('app.tenant_id', $1, true)")
        .bind(tenant_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// DDL enabling row-level security for a table.
pub fn enable_rls_sql(table: &str) -> String {
    format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY")
}

/// DDL creating the tenant isolation policy for a table.
pub fn create_policy_sql(table: &str) -> String {
    format!(
        "CREATE POLICY {TENANT_POLICY_NAME} ON {table} \
         USING ({TENANT_PREDICATE}) \
         WITH CHECK ({TENANT_PREDICATE})"
    )
}

// Table names are interpolated into DDL (they cannot be bound), so they are
// restricted to plain lowercase identifiers.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_lowercase() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(is_valid_identifier("tenants"));
        assert!(is_valid_identifier("_audit_log2"));
    }

    #[test]
    fn rejects_injection_attempts() {
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("tenants; DROP TABLE tenants"));
        assert!(!is_valid_identifier("Tenants"));
        assert!(!is_valid_identifier("public.tenants"));
    }

    #[test]
    fn policy_sql_uses_identical_read_and_write_predicates() {
        let sql = create_policy_sql("tenants");
        assert!(sql.starts_with("CREATE POLICY tenant_isolation ON tenants"));
        assert_eq!(sql.matches(TENANT_PREDICATE).count(), 2);
        assert!(sql.contains("USING ("));
        assert!(sql.contains("WITH CHECK ("));
    }

    #[test]
    fn predicate_allows_null_tenant_rows() {
        assert!(TENANT_PREDICATE.contains("tenant_id IS NULL"));
        assert!(TENANT_PREDICATE.contains("id = current_tenant_context()"));
    }

    #[test]
    fn enable_sql_targets_the_table() {
        assert_eq!(
            enable_rls_sql("tenants"),
            "ALTER TABLE tenants ENABLE ROW LEVEL SECURITY"
        );
    }
}
