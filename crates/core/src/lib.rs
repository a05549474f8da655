pub mod breaker;
pub mod lock;
pub mod tenant;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use breaker::{Admission, BreakerConfig, BreakerRegistry, CircuitBreaker, DenialReason};
pub use lock::{LockHandle, TenantLockManager};
pub use tenant::{derive_tenant_id, is_placeholder_name, Tenant, PLACEHOLDER_NAME};

/// Shared clock abstraction so state machines can be driven deterministically
/// in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Returns the default wall clock.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
