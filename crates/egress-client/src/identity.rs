//! Azure managed identity tokens.
//!
//! The resolver asks the instance metadata endpoint first and falls back to
//! the Azure CLI when that fails, times out, or development mode is on. Each
//! strategy is a [`TokenProvider`], so either can be replaced.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use egress_common::{AzureIdentitySettings, secret};

/// Resource the tokens are requested for.
pub const DEFAULT_RESOURCE: &str = "https://management.azure.com/";

/// Instance metadata token endpoint.
pub const MANAGED_IDENTITY_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const MANAGED_IDENTITY_API_VERSION: &str = "2018-02-01";

/// Upper bound for each token strategy.
pub const TOKEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors returned while acquiring an Azure token.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    #[error("failed to get managed identity token: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status code {0} from managed identity endpoint")]
    Status(reqwest::StatusCode),

    #[error("failed to decode token response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("token response has no access token")]
    EmptyToken,

    #[error("failed to run azure cli: {0}")]
    CliSpawn(#[source] std::io::Error),

    #[error("azure cli exited with {status}: {stderr}")]
    CliFailed { status: String, stderr: String },

    #[error("{provider} did not return a token within {timeout:?}")]
    Timeout {
        provider: &'static str,
        timeout: Duration,
    },
}

/// A source of bearer tokens for Azure resources.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn get_token(&self) -> Result<SecretString, IdentityError>;
}

/// Token from the instance metadata service.
#[derive(Debug, Clone)]
pub struct ManagedIdentityProvider {
    http: reqwest::Client,
    endpoint: String,
    resource: String,
}

impl ManagedIdentityProvider {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: MANAGED_IDENTITY_ENDPOINT.to_string(),
            resource: DEFAULT_RESOURCE.to_string(),
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Deserialize)]
struct ManagedIdentityToken {
    #[serde(default)]
    access_token: String,
}

#[async_trait]
impl TokenProvider for ManagedIdentityProvider {
    fn name(&self) -> &'static str {
        "managed identity"
    }

    async fn get_token(&self) -> Result<SecretString, IdentityError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("api-version", MANAGED_IDENTITY_API_VERSION),
                ("resource", self.resource.as_str()),
            ])
            .header("Metadata", "true")
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(IdentityError::Status(response.status()));
        }

        let body = response.bytes().await?;
        let token: ManagedIdentityToken = serde_json::from_slice(&body)?;
        if token.access_token.is_empty() {
            return Err(IdentityError::EmptyToken);
        }
        Ok(secret(token.access_token))
    }
}

/// Token from the locally signed-in Azure CLI.
#[derive(Debug, Clone)]
pub struct AzureCliProvider {
    program: OsString,
    resource: String,
}

impl Default for AzureCliProvider {
    fn default() -> Self {
        Self {
            program: OsString::from("az"),
            resource: DEFAULT_RESOURCE.to_string(),
        }
    }
}

impl AzureCliProvider {
    /// Runs `program` instead of `az`.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    #[serde(default)]
    access_token: String,
}

#[async_trait]
impl TokenProvider for AzureCliProvider {
    fn name(&self) -> &'static str {
        "azure cli"
    }

    async fn get_token(&self) -> Result<SecretString, IdentityError> {
        let output = tokio::process::Command::new(&self.program)
            .args(["account", "get-access-token", "--output", "json", "--resource"])
            .arg(&self.resource)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(IdentityError::CliSpawn)?;

        if !output.status.success() {
            return Err(IdentityError::CliFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let token: CliToken = serde_json::from_slice(&output.stdout)?;
        if token.access_token.is_empty() {
            return Err(IdentityError::EmptyToken);
        }
        Ok(secret(token.access_token))
    }
}

/// Managed identity with CLI fallback, each attempt bounded by a timeout.
#[derive(Clone)]
pub struct AzureIdentityResolver {
    primary: Arc<dyn TokenProvider>,
    fallback: Arc<dyn TokenProvider>,
    development_mode: bool,
    timeout: Duration,
}

impl std::fmt::Debug for AzureIdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureIdentityResolver")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.name())
            .field("development_mode", &self.development_mode)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AzureIdentityResolver {
    #[must_use]
    pub fn new(primary: Arc<dyn TokenProvider>, fallback: Arc<dyn TokenProvider>) -> Self {
        Self {
            primary,
            fallback,
            development_mode: false,
            timeout: TOKEN_TIMEOUT,
        }
    }

    /// Metadata endpoint plus `az` CLI, as configured by `settings`.
    #[must_use]
    pub fn from_settings(settings: &AzureIdentitySettings, http: reqwest::Client) -> Self {
        Self::new(
            Arc::new(ManagedIdentityProvider::new(http)),
            Arc::new(AzureCliProvider::default()),
        )
        .with_development_mode(settings.development_mode)
    }

    /// Skips the primary provider entirely.
    #[must_use]
    pub const fn with_development_mode(mut self, development_mode: bool) -> Self {
        self.development_mode = development_mode;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn bounded(&self, provider: &dyn TokenProvider) -> Result<SecretString, IdentityError> {
        tokio::time::timeout(self.timeout, provider.get_token())
            .await
            .map_err(|_| IdentityError::Timeout {
                provider: provider.name(),
                timeout: self.timeout,
            })?
    }

    /// Returns a token from the first provider that yields one.
    ///
    /// # Errors
    ///
    /// Returns the fallback provider's error when both providers fail.
    pub async fn get_token(&self) -> Result<SecretString, IdentityError> {
        if !self.development_mode {
            match self.bounded(self.primary.as_ref()).await {
                Ok(token) => {
                    tracing::debug!(provider = self.primary.name(), "fetched azure token");
                    return Ok(token);
                }
                Err(e) => tracing::error!(
                    error = %e,
                    provider = self.primary.name(),
                    fallback = self.fallback.name(),
                    "failed to fetch azure token, falling back"
                ),
            }
        }

        let token = self.bounded(self.fallback.as_ref()).await?;
        tracing::debug!(provider = self.fallback.name(), "fetched azure token");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicUsize, Ordering};

    use secrecy::ExposeSecret;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    struct FakeProvider {
        token: Option<&'static str>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn ok(token: &'static str) -> Arc<Self> {
            Arc::new(Self {
                token: Some(token),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                token: None,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(token: &'static str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                token: Some(token),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn get_token(&self) -> Result<SecretString, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.token.map(secret).ok_or(IdentityError::EmptyToken)
        }
    }

    #[tokio::test]
    async fn test_primary_token_wins() {
        let primary = FakeProvider::ok("mi-token");
        let fallback = FakeProvider::ok("cli-token");
        let resolver = AzureIdentityResolver::new(primary.clone(), fallback.clone());

        let token = resolver.get_token().await.unwrap();
        assert_eq!(token.expose_secret(), "mi-token");
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_failing_primary_falls_back() {
        let fallback = FakeProvider::ok("cli-token");
        let resolver = AzureIdentityResolver::new(FakeProvider::failing(), fallback.clone());

        let token = resolver.get_token().await.unwrap();
        assert_eq!(token.expose_secret(), "cli-token");
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_slow_primary_times_out_and_falls_back() {
        let primary = FakeProvider::slow("mi-token", Duration::from_secs(2));
        let resolver = AzureIdentityResolver::new(primary, FakeProvider::ok("cli-token"))
            .with_timeout(Duration::from_millis(50));

        let token = resolver.get_token().await.unwrap();
        assert_eq!(token.expose_secret(), "cli-token");
    }

    #[tokio::test]
    async fn test_development_mode_skips_primary() {
        let primary = FakeProvider::ok("mi-token");
        let resolver = AzureIdentityResolver::new(primary.clone(), FakeProvider::ok("cli-token"))
            .with_development_mode(true);

        let token = resolver.get_token().await.unwrap();
        assert_eq!(token.expose_secret(), "cli-token");
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn test_both_failing_is_an_error() {
        let resolver = AzureIdentityResolver::new(FakeProvider::failing(), FakeProvider::failing());
        assert!(matches!(
            resolver.get_token().await,
            Err(IdentityError::EmptyToken)
        ));
    }

    #[tokio::test]
    async fn test_managed_identity_request_shape() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/metadata/identity/oauth2/token"))
            .and(header("metadata", "true"))
            .and(query_param("api-version", "2018-02-01"))
            .and(query_param("resource", "https://management.azure.com/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "mi-token",
                "expires_in": "3599",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = ManagedIdentityProvider::new(reqwest::Client::new())
            .with_endpoint(format!("{}/metadata/identity/oauth2/token", server.uri()));
        assert_eq!(provider.get_token().await.unwrap().expose_secret(), "mi-token");
    }

    #[tokio::test]
    async fn test_managed_identity_non_200_is_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let provider = ManagedIdentityProvider::new(reqwest::Client::new()).with_endpoint(server.uri());
        assert!(matches!(
            provider.get_token().await,
            Err(IdentityError::Status(status)) if status == 400
        ));
    }

    #[tokio::test]
    async fn test_missing_cli_is_an_error() {
        let provider = AzureCliProvider::default().with_program("/nonexistent/bin/az");
        assert!(matches!(
            provider.get_token().await,
            Err(IdentityError::CliSpawn(_))
        ));
    }
}
