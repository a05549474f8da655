pub mod auth;
pub mod resilient;

pub use auth::{AuthClient, AuthError, CredentialCache, TokenGrant};
pub use resilient::{
    endpoint_key, ApiRequest, ClientError, ResilientClient, TENANT_ID_HEADER,
};
