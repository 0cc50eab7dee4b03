//! OAuth2 token-refreshing decorators.
//!
//! Two grants are supported: client credentials (RFC 6749 section 4.4) and the
//! JWT bearer assertion grant (RFC 7523). Both fetch a token from the token
//! endpoint on first use and reuse it until shortly before it expires.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use egress_common::{OAuth2AuthStyle, OAuth2Settings, expose_or_empty, secret};
use http::Extensions;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;
use url::form_urlencoded;

use super::{DecoratorError, DecoratorKind, TransportDecorator};
use crate::error::ClientError;

/// Tokens are refreshed this long before they expire.
pub const EXPIRY_LEEWAY: Duration = Duration::from_secs(10);

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const JWT_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    /// Token endpoints answer with JSON, older ones with a form-encoded body.
    fn parse(content_type: &str, body: &[u8]) -> Option<Self> {
        if content_type.contains("application/x-www-form-urlencoded")
            || content_type.contains("text/plain")
        {
            let mut response = Self {
                access_token: String::new(),
                token_type: String::new(),
                expires_in: None,
            };
            for (key, value) in form_urlencoded::parse(body) {
                match key.as_ref() {
                    "access_token" => response.access_token = value.into_owned(),
                    "token_type" => response.token_type = value.into_owned(),
                    "expires_in" => response.expires_in = value.parse().ok(),
                    _ => {}
                }
            }
            return Some(response);
        }
        serde_json::from_slice(body).ok()
    }
}

struct CachedToken {
    authorization: SecretString,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at
            .is_none_or(|expires_at| Instant::now() + EXPIRY_LEEWAY < expires_at)
    }
}

/// Canonical spelling of the token type used as the authorization scheme.
fn authorization_scheme(token_type: &str) -> &str {
    if token_type.is_empty() || token_type.eq_ignore_ascii_case("bearer") {
        "Bearer"
    } else if token_type.eq_ignore_ascii_case("mac") {
        "MAC"
    } else if token_type.eq_ignore_ascii_case("basic") {
        "Basic"
    } else {
        token_type
    }
}

/// The token endpoint plus the token last obtained from it.
struct TokenEndpoint {
    http: reqwest::Client,
    token_url: Url,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenEndpoint {
    fn new(http: reqwest::Client, token_url: &str, scheme: &'static str) -> Result<Self, ClientError> {
        let token_url = Url::parse(token_url).map_err(|e| ClientError::InvalidCredentials {
            scheme,
            reason: format!("invalid token url '{token_url}': {e}"),
        })?;
        Ok(Self {
            http,
            token_url,
            cached: Mutex::new(None),
        })
    }

    fn request_error(&self, reason: impl Into<String>) -> DecoratorError {
        DecoratorError::TokenRequest {
            token_url: self.token_url.to_string(),
            reason: reason.into(),
        }
    }

    /// Posts a token request and decodes the response.
    async fn exchange(&self, request: reqwest::RequestBuilder) -> Result<TokenResponse, DecoratorError> {
        let response = request
            .send()
            .await
            .map_err(|e| self.request_error(e.to_string()))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.request_error(e.to_string()))?;

        if !status.is_success() {
            return Err(DecoratorError::TokenRejected {
                token_url: self.token_url.to_string(),
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let token = TokenResponse::parse(&content_type, &body)
            .ok_or_else(|| self.request_error("cannot decode token response"))?;
        if token.access_token.is_empty() {
            return Err(self.request_error("server response missing access_token"));
        }
        Ok(token)
    }

    /// Returns the `Authorization` value, fetching a new token when the cached
    /// one is missing or about to expire.
    async fn authorization<F, Fut>(&self, fetch: F) -> Result<HeaderValue, DecoratorError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<TokenResponse, DecoratorError>> + Send,
    {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh()) {
            return self.header_value(token);
        }

        tracing::debug!(token_url = %self.token_url, "fetching oauth2 token");
        let response = fetch().await?;
        let token = cached.insert(CachedToken {
            authorization: secret(format!(
                "{} {}",
                authorization_scheme(&response.token_type),
                response.access_token
            )),
            expires_at: response
                .expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
        });
        self.header_value(token)
    }

    fn header_value(&self, token: &CachedToken) -> Result<HeaderValue, DecoratorError> {
        let mut value = HeaderValue::from_str(token.authorization.expose_secret())
            .map_err(|_| self.request_error("token is not a valid header value"))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Fetches tokens with the client credentials grant.
pub struct OAuthClientCredentials {
    endpoint: TokenEndpoint,
    client_id: String,
    client_secret: SecretString,
    scopes: Vec<String>,
    endpoint_params: Vec<(String, String)>,
    auth_style: OAuth2AuthStyle,
}

impl OAuthClientCredentials {
    /// Creates the decorator; tokens are requested through `http`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the token URL cannot be parsed.
    pub fn from_settings(settings: &OAuth2Settings, http: reqwest::Client) -> Result<Self, ClientError> {
        Ok(Self {
            endpoint: TokenEndpoint::new(http, &settings.token_url, "oauth2")?,
            client_id: settings.client_id.clone(),
            client_secret: secret(expose_or_empty(settings.client_secret.as_ref())),
            scopes: settings.scopes.clone(),
            endpoint_params: settings
                .endpoint_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            auth_style: settings.auth_style,
        })
    }

    fn form(&self, credentials_in_params: bool) -> Vec<(&str, &str)> {
        let mut form = vec![("grant_type", "client_credentials")];
        if credentials_in_params {
            form.push(("client_id", self.client_id.as_str()));
            if !self.client_secret.expose_secret().is_empty() {
                form.push(("client_secret", self.client_secret.expose_secret()));
            }
        }
        form.extend(
            self.endpoint_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        form
    }

    async fn request_token(&self, style: OAuth2AuthStyle) -> Result<TokenResponse, DecoratorError> {
        let scope = self.scopes.join(" ");
        let in_header = matches!(style, OAuth2AuthStyle::InHeader);
        let mut form = self.form(!in_header);
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let mut request = self
            .endpoint
            .http
            .post(self.endpoint.token_url.clone())
            .form(&form);
        if in_header {
            let user: String = form_urlencoded::byte_serialize(self.client_id.as_bytes()).collect();
            let password: String =
                form_urlencoded::byte_serialize(self.client_secret.expose_secret().as_bytes()).collect();
            request = request.basic_auth(user, Some(password));
        }
        self.endpoint.exchange(request).await
    }

    async fn fetch(&self) -> Result<TokenResponse, DecoratorError> {
        match self.auth_style {
            OAuth2AuthStyle::AutoDetect => match self.request_token(OAuth2AuthStyle::InHeader).await {
                Ok(token) => Ok(token),
                Err(err) => {
                    tracing::debug!(error = %err, "token request with basic auth failed, retrying with credentials in params");
                    self.request_token(OAuth2AuthStyle::InParams).await
                }
            },
            style => self.request_token(style).await,
        }
    }
}

#[async_trait]
impl Middleware for OAuthClientCredentials {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let authorization = self.endpoint.authorization(|| self.fetch()).await?;
        req.headers_mut().insert(AUTHORIZATION, authorization);
        next.run(req, extensions).await
    }
}

impl TransportDecorator for OAuthClientCredentials {
    fn kind(&self) -> DecoratorKind {
        DecoratorKind::OAuthClientCredentials
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    exp: i64,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
}

/// Fetches tokens by presenting a signed JWT assertion.
pub struct OAuthJwtBearer {
    endpoint: TokenEndpoint,
    email: String,
    subject: String,
    scopes: Vec<String>,
    header: Header,
    key: EncodingKey,
}

impl OAuthJwtBearer {
    /// Creates the decorator; tokens are requested through `http`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the private key is not an RSA PEM key
    /// or the token URL cannot be parsed.
    pub fn from_settings(settings: &OAuth2Settings, http: reqwest::Client) -> Result<Self, ClientError> {
        let key = EncodingKey::from_rsa_pem(expose_or_empty(settings.private_key.as_ref()).as_bytes())
            .map_err(|e| ClientError::InvalidCredentials {
                scheme: "oauth2 jwt",
                reason: format!("invalid private key: {e}"),
            })?;

        let mut header = Header::new(Algorithm::RS256);
        if !settings.private_key_id.is_empty() {
            header.kid = Some(settings.private_key_id.clone());
        }

        Ok(Self {
            endpoint: TokenEndpoint::new(http, &settings.token_url, "oauth2 jwt")?,
            email: settings.email.clone(),
            subject: settings.subject.clone(),
            scopes: settings.scopes.clone(),
            header,
            key,
        })
    }

    fn assertion(&self) -> Result<String, DecoratorError> {
        let iat = chrono::Utc::now().timestamp() - 10;
        let claims = AssertionClaims {
            iss: self.email.clone(),
            scope: self.scopes.join(" "),
            aud: self.endpoint.token_url.to_string(),
            exp: iat + JWT_LIFETIME_SECS,
            iat,
            sub: (!self.subject.is_empty()).then(|| self.subject.clone()),
        };
        Ok(jsonwebtoken::encode(&self.header, &claims, &self.key)?)
    }

    async fn fetch(&self) -> Result<TokenResponse, DecoratorError> {
        let assertion = self.assertion()?;
        let request = self
            .endpoint
            .http
            .post(self.endpoint.token_url.clone())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())]);
        self.endpoint.exchange(request).await
    }
}

#[async_trait]
impl Middleware for OAuthJwtBearer {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let authorization = self.endpoint.authorization(|| self.fetch()).await?;
        req.headers_mut().insert(AUTHORIZATION, authorization);
        next.run(req, extensions).await
    }
}

impl TransportDecorator for OAuthJwtBearer {
    fn kind(&self) -> DecoratorKind {
        DecoratorKind::OAuthJwt
    }
}
