use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use tenantry_core::{
    derive_tenant_id, is_placeholder_name, Clock, Tenant, TenantLockManager, PLACEHOLDER_NAME,
};
use tenantry_storage::{
    ensure_isolation, Database, IsolationError, NewTenant, TenantRepoError,
};

use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Table guarded by the isolation policy on first provisioning.
pub const TENANT_TABLE: &str = "tenants";

const PROVISION_LOCK_LABEL: &str = "tenant.provision";

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionBody {
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionResponse {
    pub success: bool,
    pub existed: bool,
    pub tenant_id: Uuid,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub tenant_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub exists: bool,
    pub tenant: Option<Tenant>,
}

/// Result of a provisioning attempt.
///
/// Lock contention is a structured outcome rather than an error: the caller
/// is told the operation is in progress elsewhere and should poll, not retry
/// in a tight loop.
#[derive(Debug)]
pub enum ProvisionOutcome {
    InProgress { tenant_id: Uuid },
    Completed { existed: bool, tenant: Tenant },
}

/// Errors surfaced by the provisioning service.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("either tenant_id or user_id must be supplied")]
    MissingIdentity,
    #[error("tenant repository error: {0}")]
    Tenant(#[from] TenantRepoError),
    #[error("isolation install error: {0}")]
    Isolation(#[from] IsolationError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Idempotently ensures a tenant's isolation record exists.
///
/// Per-tenant serialization comes from the lock manager; the database work is
/// a single transaction so partial creation is never observable.
#[derive(Clone)]
pub struct ProvisioningService {
    database: Database,
    locks: TenantLockManager,
    clock: Clock,
}

impl ProvisioningService {
    pub fn new(database: Database, locks: TenantLockManager, clock: Clock) -> Self {
        Self {
            database,
            locks,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Resolves the target tenant id from an explicit id or, failing that,
    /// derives it deterministically from the user id.
    pub fn resolve_tenant_id(body: &ProvisionBody) -> Result<Uuid, ProvisionError> {
        if let Some(tenant_id) = body.tenant_id {
            return Ok(tenant_id);
        }
        if let Some(user_id) = body.user_id.as_deref() {
            return Ok(derive_tenant_id(user_id));
        }
        Err(ProvisionError::MissingIdentity)
    }

    pub async fn ensure_tenant(
        &self,
        body: &ProvisionBody,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let tenant_id = Self::resolve_tenant_id(body)?;

        let Some(handle) = self.locks.acquire(tenant_id, PROVISION_LOCK_LABEL) else {
            info!(
                stage = "provision",
                tenant_id = %tenant_id,
                "provisioning already in progress, refusing to double-run"
            );
            return Ok(ProvisionOutcome::InProgress { tenant_id });
        };

        let outcome = self.provision_locked(tenant_id, body).await;

        // Release happens on every path; a false return means the lease
        // expired mid-operation and a newer holder took over.
        if !self.locks.release(tenant_id, handle.token) {
            warn!(
                stage = "provision",
                tenant_id = %tenant_id,
                acquired_at = %handle.acquired_at,
                "lock was reclaimed before release"
            );
        }

        outcome
    }

    async fn provision_locked(
        &self,
        tenant_id: Uuid,
        body: &ProvisionBody,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let repo = self.database.tenants();
        let mut tx = repo.begin().await?;
        let now = self.now();

        if let Some(existing) = repo.fetch_in_tx(&mut tx, tenant_id).await? {
            let supplied_name = body
                .display_name
                .as_deref()
                .filter(|name| !is_placeholder_name(name));
            if let (Some(name), true) = (supplied_name, is_placeholder_name(&existing.name)) {
                let updated = repo.rename_placeholder(&mut tx, tenant_id, name, now).await?;
                tx.commit().await?;
                info!(
                    stage = "provision",
                    tenant_id = %tenant_id,
                    "replaced placeholder tenant name"
                );
                return Ok(ProvisionOutcome::Completed {
                    existed: true,
                    tenant: updated,
                });
            }
            tx.commit().await?;
            return Ok(ProvisionOutcome::Completed {
                existed: true,
                tenant: existing,
            });
        }

        let name = body
            .display_name
            .as_deref()
            .filter(|name| !is_placeholder_name(name))
            .unwrap_or(PLACEHOLDER_NAME);
        let record = NewTenant {
            id: tenant_id,
            name,
            owner_id: body.user_id.as_deref(),
            created_at: now,
        };
        match repo.insert(&mut tx, &record).await {
            Ok(_) => {}
            Err(TenantRepoError::Duplicate) => {
                // Another instance won the insert race; dropping the
                // transaction rolls our half back, then we read the winner.
                drop(tx);
                let tenant = repo
                    .fetch(tenant_id)
                    .await?
                    .ok_or(TenantRepoError::NotFound)?;
                return Ok(ProvisionOutcome::Completed {
                    existed: true,
                    tenant,
                });
            }
            Err(err) => return Err(err.into()),
        }

        ensure_isolation(&mut tx, TENANT_TABLE).await?;
        let tenant = repo.mark_isolation_ready(&mut tx, tenant_id, now).await?;
        tx.commit().await?;

        info!(
            stage = "provision",
            tenant_id = %tenant_id,
            owner = body.user_id.as_deref().unwrap_or("<none>"),
            "tenant provisioned with isolation policy"
        );
        Ok(ProvisionOutcome::Completed {
            existed: false,
            tenant,
        })
    }
}

pub async fn provision(
    State(state): State<AppState>,
    Json(body): Json<ProvisionBody>,
) -> Result<Response, ProblemResponse> {
    match state.provisioner().ensure_tenant(&body).await {
        Ok(ProvisionOutcome::Completed { existed, tenant }) => {
            let result = if existed { "existed" } else { "created" };
            counter!("tenant_provision_total", "result" => result).increment(1);
            let message = if existed {
                "tenant already provisioned"
            } else {
                "tenant provisioned"
            };
            Ok((
                StatusCode::OK,
                Json(ProvisionResponse {
                    success: true,
                    existed,
                    tenant_id: tenant.id,
                    message: message.to_string(),
                }),
            )
                .into_response())
        }
        Ok(ProvisionOutcome::InProgress { tenant_id }) => {
            counter!("tenant_provision_total", "result" => "locked").increment(1);
            Ok((
                StatusCode::ACCEPTED,
                Json(ProvisionResponse {
                    success: false,
                    existed: false,
                    tenant_id,
                    message: "provisioning already in progress, try again shortly".to_string(),
                }),
            )
                .into_response())
        }
        Err(ProvisionError::MissingIdentity) => Err(ProblemResponse::bad_request(
            "missing_identity",
            "either tenant_id or user_id must be supplied",
        )),
        Err(err) => {
            counter!("tenant_provision_total", "result" => "failed").increment(1);
            error!(stage = "provision", error = %err, "tenant provisioning failed");
            Err(ProblemResponse::internal(
                "provisioning_failed",
                "tenant provisioning failed and was rolled back",
            ))
        }
    }
}

pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ProblemResponse> {
    match state.storage().tenants().fetch(query.tenant_id).await {
        Ok(tenant) => {
            let result = if tenant.is_some() { "found" } else { "missing" };
            counter!("tenant_status_requests_total", "result" => result).increment(1);
            Ok(Json(StatusResponse {
                exists: tenant.is_some(),
                tenant,
            }))
        }
        Err(err) => {
            error!(stage = "provision", error = %err, "failed to load tenant status");
            Err(ProblemResponse::internal(
                "status_failed",
                "failed to load tenant status",
            ))
        }
    }
}
