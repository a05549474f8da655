use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace used when deriving tenant identifiers from user identifiers.
///
/// The value is fixed for the lifetime of the product; changing it would remap
/// every derived tenant id, so new derivation schemes must bump
/// [`TENANT_ID_DERIVATION_VERSION`] instead.
pub const TENANT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x8c5b_2de1_94a7_4c39_b1f0_6d3a_85e4_77c2);

/// Version label folded into the derivation input.
pub const TENANT_ID_DERIVATION_VERSION: &str = "v1";

/// Display name assigned to tenants that were provisioned before the owner
/// supplied a real name. Only placeholder values may be replaced later.
pub const PLACEHOLDER_NAME: &str = "Pending Setup";

const LEGACY_PLACEHOLDER_NAMES: &[&str] = &["My Business", "New Tenant"];

/// An isolated customer partition within the shared data store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub isolation_enabled: bool,
    pub isolation_setup_at: Option<DateTime<Utc>>,
}

/// Derives the tenant id for a user identifier.
///
/// The derivation is a pure function of the namespace, the derivation version,
/// and the user id, so repeated calls for the same user always target the same
/// tenant without a lookup.
pub fn derive_tenant_id(user_id: &str) -> Uuid {
    let input = format!("{TENANT_ID_DERIVATION_VERSION}:{user_id}");
    Uuid::new_v5(&TENANT_ID_NAMESPACE, input.as_bytes())
}

/// Returns `true` when the stored display name is a placeholder that may be
/// replaced by a caller-supplied name.
pub fn is_placeholder_name(name: &str) -> bool {
    let trimmed = name.trim();
    trimmed.is_empty()
        || trimmed == PLACEHOLDER_NAME
        || LEGACY_PLACEHOLDER_NAMES.contains(&trimmed)
}
