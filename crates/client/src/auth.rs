use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// Client for the credential-issuing endpoint of the identity provider.
#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
}

impl AuthClient {
    /// Creates a new client with the provided HTTP instance and configuration.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        base_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Exchanges a refresh token for a fresh access token.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let url = self.base_url.join("token")?;
        let response = self
            .http
            .post(url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        parse_json(response).await
    }
}

/// Token grant returned by the identity provider.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    pub token_type: String,
}

impl TokenGrant {
    /// Computes the expiration timestamp relative to the provided instant.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.expires_in as i64)
    }
}

/// Errors that can occur while talking to the identity provider.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, AuthError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(AuthError::Status { status, body });
    }

    Ok(response.json().await?)
}

#[derive(Debug)]
struct CredentialState {
    access_token: String,
    refresh_token: String,
}

/// Shared cache for the bearer credential attached to outbound calls.
///
/// Refreshing mutates the cache in place, so every caller holding a clone
/// observes the new credential. Refresh is a side-effecting operation and
/// must not be treated as idempotent.
#[derive(Clone)]
pub struct CredentialCache {
    state: Arc<RwLock<CredentialState>>,
}

impl CredentialCache {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(CredentialState {
                access_token: access_token.into(),
                refresh_token: refresh_token.into(),
            })),
        }
    }

    /// Returns the current bearer credential.
    pub fn bearer(&self) -> String {
        self.state
            .read()
            .expect("credential cache poisoned")
            .access_token
            .clone()
    }

    /// Returns the current refresh token.
    pub fn refresh_token(&self) -> String {
        self.state
            .read()
            .expect("credential cache poisoned")
            .refresh_token
            .clone()
    }

    /// Replaces the cached credentials with a freshly issued grant.
    pub fn store_grant(&self, grant: &TokenGrant) {
        let mut state = self.state.write().expect("credential cache poisoned");
        state.access_token = grant.access_token.clone();
        if let Some(refresh_token) = &grant.refresh_token {
            state.refresh_token = refresh_token.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(base_url: &Url) -> AuthClient {
        AuthClient::new(
            "client",
            "secret",
            base_url.clone(),
            Client::builder().build().expect("client"),
        )
    }

    #[tokio::test]
    async fn refresh_token_roundtrips() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/identity/")).expect("url");
        let client = client(&base);

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/identity/token")
                    .body_contains("grant_type=refresh_token")
                    .body_contains("refresh_token=refresh");
                then.status(200).json_body(json!({
                    "access_token": "new-access",
                    "refresh_token": "new-refresh",
                    "expires_in": 3600,
                    "token_type": "bearer"
                }));
            })
            .await;

        let grant = client.refresh_token("refresh").await.expect("refresh");
        mock.assert_async().await;
        assert_eq!(grant.access_token, "new-access");
        assert_eq!(grant.refresh_token.as_deref(), Some("new-refresh"));
    }

    #[tokio::test]
    async fn non_success_status_returns_error() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/identity/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(POST).path("/identity/token");
                then.status(400).body("bad request");
            })
            .await;

        let err = client
            .refresh_token("refresh")
            .await
            .expect_err("should error");
        match err {
            AuthError::Status { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "bad request");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn store_grant_keeps_old_refresh_token_when_absent() {
        let cache = CredentialCache::new("access", "refresh");
        cache.store_grant(&TokenGrant {
            access_token: "rotated".to_string(),
            refresh_token: None,
            expires_in: 60,
            token_type: "bearer".to_string(),
        });

        assert_eq!(cache.bearer(), "rotated");
        assert_eq!(cache.refresh_token(), "refresh");
    }

    #[test]
    fn store_grant_rotates_both_tokens() {
        let cache = CredentialCache::new("access", "refresh");
        cache.store_grant(&TokenGrant {
            access_token: "a2".to_string(),
            refresh_token: Some("r2".to_string()),
            expires_in: 60,
            token_type: "bearer".to_string(),
        });

        assert_eq!(cache.bearer(), "a2");
        assert_eq!(cache.refresh_token(), "r2");
    }
}
