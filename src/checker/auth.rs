//! OAuth device-flow authentication against GitHub.
//!
//! The flow has two steps: request a device code and show the user where
//! to enter it, then poll the token endpoint until the user approves, the
//! server refuses, or the device code expires. Both steps run through a
//! [`CircuitBreaker`].

use super::breaker::CircuitBreaker;
use crate::cache::Cache;
use crate::error::ScanError;
use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_AUTH_URL: &str = "https://github.com";

/// Cache key under which the device-flow token is stored.
pub const TOKEN_CACHE_KEY: &str = "github-access-token";

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Supplies bearer tokens for advisory queries.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, cancel: &CancellationToken) -> Result<String, ScanError>;

    /// Forgets a token the server rejected.
    fn invalidate(&self) {}
}

/// A token known up front (environment variable or config file).
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self, _cancel: &CancellationToken) -> Result<String, ScanError> {
        Ok(self.0.clone())
    }
}

fn default_poll_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    pub expires_in: Option<u64>,
}

// The token endpoint answers 200 for both grants and polling errors.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    scope: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
    interval: Option<u64>,
}

enum PollStep {
    Granted(AccessToken),
    Pending,
    SlowDown(Option<u64>),
}

impl TokenResponse {
    fn into_step(self) -> Result<PollStep, ScanError> {
        match self.error.as_deref() {
            Some("authorization_pending") => return Ok(PollStep::Pending),
            Some("slow_down") => return Ok(PollStep::SlowDown(self.interval)),
            Some(code) if !code.is_empty() => {
                return Err(ScanError::Auth(match self.error_description {
                    Some(description) => format!("{}: {}", code, description),
                    None => code.to_string(),
                }))
            }
            _ => {}
        }

        match self.access_token {
            Some(access_token) if !access_token.is_empty() => Ok(PollStep::Granted(AccessToken {
                access_token,
                token_type: self.token_type.unwrap_or_default(),
                scope: self.scope.unwrap_or_default(),
                expires_in: self.expires_in,
            })),
            _ => Err(ScanError::Decode(
                "token response carried neither a token nor an error".to_string(),
            )),
        }
    }
}

/// HTTP side of the device flow.
pub struct DeviceFlowClient {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    scope: String,
    breaker: Arc<CircuitBreaker>,
}

impl DeviceFlowClient {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        scope: impl Into<String>,
        request_timeout: Duration,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("deepscan/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            scope: scope.into(),
            breaker,
        })
    }

    pub async fn request_device_code(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DeviceCode, ScanError> {
        let url = format!("{}/login/device/code", self.base_url);
        self.breaker
            .execute(cancel, || async {
                let response = self
                    .client
                    .post(&url)
                    .header(header::ACCEPT, "application/json")
                    .form(&[
                        ("client_id", self.client_id.as_str()),
                        ("scope", self.scope.as_str()),
                    ])
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    return Err(ScanError::Status {
                        status: status.as_u16(),
                        message: response.text().await.unwrap_or_default(),
                    });
                }
                response
                    .json::<DeviceCode>()
                    .await
                    .map_err(|e| ScanError::Decode(e.to_string()))
            })
            .await
    }

    /// Polls the token endpoint until the user approves the device code.
    ///
    /// `authorization_pending` waits one more interval, `slow_down` widens
    /// the interval, and any other error code ends polling.
    pub async fn poll_access_token(
        &self,
        device: &DeviceCode,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, ScanError> {
        let deadline = Instant::now() + Duration::from_secs(device.expires_in);
        let mut interval = Duration::from_secs(device.interval);

        loop {
            if Instant::now() >= deadline {
                return Err(ScanError::Auth(
                    "device code expired before it was authorized".to_string(),
                ));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }

            let step = self
                .breaker
                .execute(cancel, || self.exchange_device_code(device))
                .await?;

            match step {
                PollStep::Granted(token) => return Ok(token),
                PollStep::Pending => {
                    tracing::debug!("authorization pending");
                }
                PollStep::SlowDown(next) => {
                    interval = next
                        .map(Duration::from_secs)
                        .unwrap_or(interval + SLOW_DOWN_STEP);
                    tracing::debug!(interval_secs = interval.as_secs(), "token endpoint asked to slow down");
                }
            }
        }
    }

    async fn exchange_device_code(&self, device: &DeviceCode) -> Result<PollStep, ScanError> {
        let response = self
            .client
            .post(format!("{}/login/oauth/access_token", self.base_url))
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("device_code", device.device_code.as_str()),
                ("grant_type", DEVICE_GRANT_TYPE),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScanError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ScanError::Decode(e.to_string()))?
            .into_step()
    }
}

type PromptFn = dyn Fn(&DeviceCode) + Send + Sync;

/// Device-flow token provider.
///
/// The token lives in a [`Cache`], so concurrent callers share a single
/// device flow and later callers reuse its token until it expires.
pub struct DeviceFlowAuthenticator {
    client: Arc<DeviceFlowClient>,
    cache: Cache<AccessToken>,
    on_prompt: Arc<PromptFn>,
}

impl DeviceFlowAuthenticator {
    pub fn new(client: Arc<DeviceFlowClient>, cache: Cache<AccessToken>) -> Self {
        Self {
            client,
            cache,
            on_prompt: Arc::new(|device: &DeviceCode| {
                tracing::info!(
                    user_code = %device.user_code,
                    verification_uri = %device.verification_uri,
                    "enter the code at the verification URL to authorize"
                );
            }),
        }
    }

    /// Replaces how the user code is shown to the user.
    pub fn with_prompt(mut self, prompt: impl Fn(&DeviceCode) + Send + Sync + 'static) -> Self {
        self.on_prompt = Arc::new(prompt);
        self
    }

    /// Returns the cached token or runs the device flow.
    pub async fn authenticate(&self, cancel: &CancellationToken) -> Result<AccessToken, ScanError> {
        let client = Arc::clone(&self.client);
        let prompt = Arc::clone(&self.on_prompt);
        let cancel = cancel.clone();
        let default_ttl = self.cache.ttl();

        self.cache
            .get_or_create_with(TOKEN_CACHE_KEY, move || async move {
                let device = client.request_device_code(&cancel).await?;
                prompt(&device);
                let token = client.poll_access_token(&device, &cancel).await?;
                let ttl = token
                    .expires_in
                    .map(Duration::from_secs)
                    .unwrap_or(default_ttl);
                Ok((token, ttl))
            })
            .await
    }
}

#[async_trait]
impl TokenProvider for DeviceFlowAuthenticator {
    async fn access_token(&self, cancel: &CancellationToken) -> Result<String, ScanError> {
        self.authenticate(cancel).await.map(|token| token.access_token)
    }

    fn invalidate(&self) {
        self.cache.invalidate(TOKEN_CACHE_KEY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::BreakerSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn flow_client(server: &MockServer) -> Arc<DeviceFlowClient> {
        Arc::new(
            DeviceFlowClient::new(
                server.uri(),
                "client-123",
                "repo",
                Duration::from_secs(5),
                Arc::new(CircuitBreaker::new("auth", BreakerSettings::default())),
            )
            .unwrap(),
        )
    }

    fn device(expires_in: u64) -> DeviceCode {
        DeviceCode {
            device_code: "dev-code".to_string(),
            user_code: "ABCD-1234".to_string(),
            verification_uri: "https://github.com/login/device".to_string(),
            expires_in,
            interval: 0,
        }
    }

    async fn mount_device_code(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/login/device/code"))
            .and(body_string_contains("client_id=client-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "device_code": "dev-code",
                "user_code": "ABCD-1234",
                "verification_uri": "https://github.com/login/device",
                "expires_in": 900,
                "interval": 0
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    async fn mount_granted(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "gho_token",
                "token_type": "bearer",
                "scope": "repo"
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_request_device_code() {
        let server = MockServer::start().await;
        mount_device_code(&server, 1).await;

        let code = flow_client(&server)
            .request_device_code(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(code.user_code, "ABCD-1234");
        assert_eq!(code.expires_in, 900);
    }

    #[tokio::test]
    async fn test_poll_waits_through_pending_and_slow_down() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .and(body_string_contains("device_code=dev-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "authorization_pending"
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "slow_down",
                "interval": 0
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_granted(&server).await;

        let token = flow_client(&server)
            .poll_access_token(&device(900), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(token.access_token, "gho_token");
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_poll_stops_on_terminal_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "access_denied",
                "error_description": "The user has denied your application access."
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = flow_client(&server)
            .poll_access_token(&device(900), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ScanError::Auth(message) => assert!(message.starts_with("access_denied")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_expired_device_code_is_not_polled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let err = flow_client(&server)
            .poll_access_token(&device(0), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::Auth(_)));
    }

    #[tokio::test]
    async fn test_cancelled_poll_returns_promptly() {
        let server = MockServer::start().await;
        let mut slow = device(900);
        slow.interval = 3600;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = flow_client(&server)
            .poll_access_token(&slow, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_device_flow() {
        let server = MockServer::start().await;
        mount_device_code(&server, 1).await;
        mount_granted(&server).await;

        let prompts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&prompts);
        let auth = DeviceFlowAuthenticator::new(flow_client(&server), Cache::new()).with_prompt(
            move |code: &DeviceCode| {
                assert_eq!(code.user_code, "ABCD-1234");
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(auth.access_token(&cancel), auth.access_token(&cancel));
        assert_eq!(a.unwrap(), "gho_token");
        assert_eq!(b.unwrap(), "gho_token");

        // Served from the cache.
        assert_eq!(auth.access_token(&cancel).await.unwrap(), "gho_token");
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_flow() {
        let server = MockServer::start().await;
        mount_device_code(&server, 2).await;
        mount_granted(&server).await;

        let auth = DeviceFlowAuthenticator::new(flow_client(&server), Cache::new())
            .with_prompt(|_: &DeviceCode| {});
        let cancel = CancellationToken::new();

        auth.access_token(&cancel).await.unwrap();
        auth.invalidate();
        auth.access_token(&cancel).await.unwrap();
    }
}
