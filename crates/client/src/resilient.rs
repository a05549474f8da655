use std::time::Duration;

use metrics::counter;
use reqwest::{header, Client, Method, Response, StatusCode};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use tenantry_core::{Admission, BreakerRegistry, DenialReason};

use crate::auth::{AuthClient, CredentialCache};

/// Header carrying the tenant context on every tenant-scoped call.
pub const TENANT_ID_HEADER: &str = "Tenant-Id";

/// Hard per-attempt timeout for general calls.
pub const GENERAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard per-attempt timeout for health/status style calls.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

const TIMEOUT_BACKOFF_MULTIPLIER: f64 = 1.5;
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(250);
const MAX_TRANSIENT_RETRIES: u32 = 1;

/// An outbound API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub tenant_id: Option<Uuid>,
    pub body: Option<serde_json::Value>,
    /// Overrides the class-based default timeout when set.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            tenant_id: None,
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url, body: serde_json::Value) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(body);
        request
    }

    /// Attaches the tenant context; it travels as a request header, never as
    /// a body field.
    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn attempt_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| {
            if is_health_path(self.url.path()) {
                HEALTH_TIMEOUT
            } else {
                GENERAL_TIMEOUT
            }
        })
    }
}

/// Resolves the logical endpoint key from a request target: the path with the
/// query stripped, scheme and host agnostic.
pub fn endpoint_key(url: &Url) -> String {
    url.path().to_string()
}

fn is_health_path(path: &str) -> bool {
    let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    matches!(last, "health" | "healthz" | "status" | "ping")
}

/// Errors surfaced by [`ResilientClient::dispatch`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The breaker denied admission; no network call was attempted. Callers
    /// should surface a degraded-mode message, not retry synchronously.
    #[error("circuit denied admission for {endpoint} ({reason})")]
    CircuitOpen {
        endpoint: String,
        reason: DenialReason,
    },
    /// One refresh-and-retry cycle already failed; the caller must force
    /// re-authentication.
    #[error("authentication expired and a credential refresh did not recover")]
    AuthExpired,
    /// Retry budget exhausted on timeout/connect failures; safe to retry
    /// later with backoff.
    #[error("transient failure after retry budget exhausted: {0}")]
    Transient(#[source] reqwest::Error),
    /// The downstream rejected the tenant context. Never retried.
    #[error("tenant isolation violation: {detail}")]
    IsolationViolation { detail: String },
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
}

/// Outbound call wrapper that attaches identity and tenant context, refreshes
/// expired credentials once, retries transient failures, and consults the
/// breaker registry before dispatching.
#[derive(Clone)]
pub struct ResilientClient {
    http: Client,
    auth: AuthClient,
    credentials: CredentialCache,
    breakers: BreakerRegistry,
}

impl ResilientClient {
    pub fn new(
        http: Client,
        auth: AuthClient,
        credentials: CredentialCache,
        breakers: BreakerRegistry,
    ) -> Self {
        Self {
            http,
            auth,
            credentials,
            breakers,
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    /// Dispatches a request with admission control, auth refresh, and
    /// transient retry.
    ///
    /// The breaker observes exactly one outcome per outer call, no matter how
    /// many internal retries occurred.
    pub async fn dispatch(&self, request: ApiRequest) -> Result<Response, ClientError> {
        let endpoint = endpoint_key(&request.url);
        let breaker = self.breakers.get_or_create(&endpoint);

        if let Admission::Denied { reason } = breaker.may_admit() {
            counter!("circuit_denied_total", "reason" => reason.as_str()).increment(1);
            warn!(
                stage = "client",
                endpoint = %endpoint,
                reason = %reason,
                "admission refused, failing fast"
            );
            return Err(ClientError::CircuitOpen { endpoint, reason });
        }

        breaker.on_request_started();
        let outcome = self.dispatch_with_retries(&request, &endpoint).await;
        match &outcome {
            Ok(_) => breaker.on_success(),
            Err(_) => breaker.on_failure(),
        }
        outcome
    }

    async fn dispatch_with_retries(
        &self,
        request: &ApiRequest,
        endpoint: &str,
    ) -> Result<Response, ClientError> {
        let mut timeout = request.attempt_timeout();
        let mut transient_retries = 0u32;
        let mut refreshed = false;

        loop {
            match self.send_once(request, timeout).await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::UNAUTHORIZED {
                        if refreshed {
                            return Err(ClientError::AuthExpired);
                        }
                        refreshed = true;
                        counter!("outbound_refresh_total").increment(1);
                        info!(
                            stage = "client",
                            endpoint,
                            "received 401, refreshing credentials once"
                        );
                        self.refresh_credentials().await?;
                        continue;
                    }

                    if status == StatusCode::FORBIDDEN {
                        let body = read_body(response).await;
                        if is_isolation_violation(&body) {
                            return Err(ClientError::IsolationViolation { detail: body });
                        }
                        return Err(ClientError::Status { status, body });
                    }

                    if !status.is_success() {
                        let body = read_body(response).await;
                        return Err(ClientError::Status { status, body });
                    }

                    return Ok(response);
                }
                Err(err) if err.is_timeout() || err.is_connect() => {
                    if transient_retries >= MAX_TRANSIENT_RETRIES {
                        return Err(ClientError::Transient(err));
                    }
                    transient_retries += 1;
                    counter!("outbound_retries_total", "kind" => "timeout").increment(1);
                    timeout = timeout.mul_f64(TIMEOUT_BACKOFF_MULTIPLIER);
                    warn!(
                        stage = "client",
                        endpoint,
                        retry = transient_retries,
                        next_timeout_ms = timeout.as_millis() as u64,
                        "transient failure, retrying with increased timeout"
                    );
                    tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
                }
                Err(err) => return Err(ClientError::Http(err)),
            }
        }
    }

    async fn send_once(
        &self,
        request: &ApiRequest,
        timeout: Duration,
    ) -> Result<Response, reqwest::Error> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .timeout(timeout)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.credentials.bearer()),
            );

        if let Some(tenant_id) = request.tenant_id {
            builder = builder.header(TENANT_ID_HEADER, tenant_id.to_string());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder.send().await
    }

    async fn refresh_credentials(&self) -> Result<(), ClientError> {
        let refresh_token = self.credentials.refresh_token();
        let grant = self
            .auth
            .refresh_token(&refresh_token)
            .await
            .map_err(|err| {
                warn!(stage = "client", error = %err, "credential refresh failed");
                ClientError::AuthExpired
            })?;
        self.credentials.store_grant(&grant);
        Ok(())
    }
}

async fn read_body(response: Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<unavailable>"))
}

fn is_isolation_violation(body: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    ["error", "code"]
        .iter()
        .filter_map(|key| value.get(key).and_then(|v| v.as_str()))
        .any(|code| code == "tenant_mismatch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use tenantry_core::BreakerConfig;

    fn resilient_client(server: &MockServer) -> ResilientClient {
        let http = Client::builder().build().expect("client");
        let auth = AuthClient::new(
            "client",
            "secret",
            Url::parse(&server.url("/identity/")).expect("url"),
            http.clone(),
        );
        let credentials = CredentialCache::new("stale-token", "refresh-1");
        ResilientClient::new(
            http,
            auth,
            credentials,
            BreakerRegistry::new(BreakerConfig::default()),
        )
    }

    fn request(server: &MockServer, path: &str) -> ApiRequest {
        ApiRequest::get(Url::parse(&server.url(path)).expect("url"))
    }

    #[test]
    fn endpoint_key_strips_query_and_host() {
        let url = Url::parse("https://api.example.com/v1/orders?page=2").expect("url");
        assert_eq!(endpoint_key(&url), "/v1/orders");
        let other = Url::parse("http://other.internal/v1/orders").expect("url");
        assert_eq!(endpoint_key(&other), endpoint_key(&url));
    }

    #[test]
    fn health_paths_get_the_short_timeout() {
        let health = ApiRequest::get(Url::parse("https://api.example.com/v1/health").unwrap());
        assert_eq!(health.attempt_timeout(), HEALTH_TIMEOUT);
        let orders = ApiRequest::get(Url::parse("https://api.example.com/v1/orders").unwrap());
        assert_eq!(orders.attempt_timeout(), GENERAL_TIMEOUT);
    }

    #[tokio::test]
    async fn attaches_bearer_and_tenant_header() {
        let server = MockServer::start_async().await;
        let client = resilient_client(&server);
        let tenant = Uuid::new_v4();

        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/orders")
                    .header("Authorization", "Bearer stale-token")
                    .header("Tenant-Id", tenant.to_string());
                then.status(200).json_body(json!({ "orders": [] }));
            })
            .await;

        let response = client
            .dispatch(request(&server, "/v1/orders").with_tenant(tenant))
            .await
            .expect("dispatch");
        mock.assert_async().await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn refreshes_once_on_unauthorized_then_retries() {
        let server = MockServer::start_async().await;
        let client = resilient_client(&server);

        let stale = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/orders")
                    .header("Authorization", "Bearer stale-token");
                then.status(401);
            })
            .await;
        let refresh = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/identity/token")
                    .body_contains("grant_type=refresh_token");
                then.status(200).json_body(json!({
                    "access_token": "fresh-token",
                    "refresh_token": "refresh-2",
                    "expires_in": 3600,
                    "token_type": "bearer"
                }));
            })
            .await;
        let fresh = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/orders")
                    .header("Authorization", "Bearer fresh-token");
                then.status(200).json_body(json!({ "orders": [] }));
            })
            .await;

        let response = client
            .dispatch(request(&server, "/v1/orders"))
            .await
            .expect("dispatch");
        assert_eq!(response.status(), StatusCode::OK);
        stale.assert_async().await;
        refresh.assert_async().await;
        fresh.assert_async().await;
        assert_eq!(client.credentials().refresh_token(), "refresh-2");
    }

    #[tokio::test]
    async fn second_unauthorized_is_terminal() {
        let server = MockServer::start_async().await;
        let client = resilient_client(&server);

        let rejected = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/orders");
                then.status(401);
            })
            .await;
        let refresh = server
            .mock_async(|when, then| {
                when.method(POST).path("/identity/token");
                then.status(200).json_body(json!({
                    "access_token": "fresh-token",
                    "expires_in": 3600,
                    "token_type": "bearer"
                }));
            })
            .await;

        let err = client
            .dispatch(request(&server, "/v1/orders"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, ClientError::AuthExpired));
        assert_eq!(rejected.hits_async().await, 2);
        assert_eq!(refresh.hits_async().await, 1);
    }

    #[tokio::test]
    async fn isolation_violation_is_not_retried() {
        let server = MockServer::start_async().await;
        let client = resilient_client(&server);

        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/orders");
                then.status(403)
                    .json_body(json!({ "error": "tenant_mismatch" }));
            })
            .await;

        let err = client
            .dispatch(request(&server, "/v1/orders"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, ClientError::IsolationViolation { .. }));
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn plain_forbidden_is_a_status_error() {
        let server = MockServer::start_async().await;
        let client = resilient_client(&server);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/orders");
                then.status(403).body("forbidden");
            })
            .await;

        let err = client
            .dispatch(request(&server, "/v1/orders"))
            .await
            .expect_err("should fail");
        assert!(matches!(
            err,
            ClientError::Status {
                status: StatusCode::FORBIDDEN,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn timeout_is_retried_once_then_surfaced_as_transient() {
        let server = MockServer::start_async().await;
        let client = resilient_client(&server);

        let slow = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/orders");
                then.status(200)
                    .delay(Duration::from_millis(700))
                    .json_body(json!({ "orders": [] }));
            })
            .await;

        let err = client
            .dispatch(
                request(&server, "/v1/orders").with_timeout(Duration::from_millis(100)),
            )
            .await
            .expect_err("should time out");
        assert!(matches!(err, ClientError::Transient(_)));
        assert_eq!(slow.hits_async().await, 2);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_network_call() {
        let server = MockServer::start_async().await;
        let client = resilient_client(&server);

        let slow = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/orders");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(json!({}));
            })
            .await;

        // Three timed-out calls trip the default threshold.
        for _ in 0..3 {
            let err = client
                .dispatch(
                    request(&server, "/v1/orders").with_timeout(Duration::from_millis(50)),
                )
                .await
                .expect_err("should time out");
            assert!(matches!(err, ClientError::Transient(_)));
        }
        let hits_before = slow.hits_async().await;

        let err = client
            .dispatch(request(&server, "/v1/orders"))
            .await
            .expect_err("should fail fast");
        assert!(matches!(err, ClientError::CircuitOpen { .. }));
        assert_eq!(slow.hits_async().await, hits_before);
    }

    #[test]
    fn isolation_violation_detection_requires_the_code() {
        assert!(is_isolation_violation(r#"{"error":"tenant_mismatch"}"#));
        assert!(is_isolation_violation(
            r#"{"code":"tenant_mismatch","detail":"tenant does not own resource"}"#
        ));
        assert!(!is_isolation_violation(r#"{"error":"forbidden"}"#));
        assert!(!is_isolation_violation("not json"));
    }
}
