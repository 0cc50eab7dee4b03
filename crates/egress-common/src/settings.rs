use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// Timeout applied when the settings leave `timeout_in_seconds` at zero.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Authentication scheme selected for a connection.
///
/// The serialized names match the values stored by the settings editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[non_exhaustive]
pub enum AuthenticationMethod {
    /// No authentication.
    #[serde(rename = "none")]
    None,
    /// HTTP basic authentication with user name and password.
    #[serde(rename = "basicAuth")]
    Basic,
    /// Static bearer token.
    #[serde(rename = "bearerToken")]
    BearerToken,
    /// API key sent either as a header or as a query parameter.
    #[serde(rename = "apiKey")]
    ApiKey,
    /// HTTP digest authentication.
    #[serde(rename = "digestAuth")]
    Digest,
    /// OAuth2, with the grant selected by [`OAuth2Settings::oauth2_type`].
    #[serde(rename = "oauth2")]
    OAuth2,
    /// AWS Signature Version 4 request signing.
    #[serde(rename = "aws")]
    Aws,
    /// Azure blob storage shared-key credentials.
    #[serde(rename = "azureBlob")]
    AzureBlob,
    /// Azure managed identity bearer token.
    #[serde(rename = "azureManagedIdentity")]
    AzureManagedIdentity,
    /// Forward the caller's OAuth identity headers.
    #[serde(rename = "oauthPassThru")]
    ForwardOauth,
}

impl fmt::Display for AuthenticationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Basic => "basicAuth",
            Self::BearerToken => "bearerToken",
            Self::ApiKey => "apiKey",
            Self::Digest => "digestAuth",
            Self::OAuth2 => "oauth2",
            Self::Aws => "aws",
            Self::AzureBlob => "azureBlob",
            Self::AzureManagedIdentity => "azureManagedIdentity",
            Self::ForwardOauth => "oauthPassThru",
        };
        f.write_str(name)
    }
}

/// Where an API key is placed on the outgoing request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    /// As a request header named by `api_key_key`.
    #[default]
    Header,
    /// As a URL query parameter named by `api_key_key`.
    Query,
}

/// Proxy selection for the base transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Use the `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` environment variables.
    #[default]
    Env,
    /// Never use a proxy, not even one from the environment.
    None,
    /// Use the proxy given in `proxy_url`.
    Url,
}

/// OAuth2 grant used when the method is [`AuthenticationMethod::OAuth2`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuth2Type {
    /// Client credentials grant (RFC 6749 section 4.4).
    #[default]
    ClientCredentials,
    /// JWT bearer assertion grant (RFC 7523).
    Jwt,
    /// Any other grant; no token decorator is installed.
    #[serde(other)]
    Others,
}

/// How client credentials are presented to the token endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuth2AuthStyle {
    /// Try HTTP basic first, then fall back to form parameters.
    #[default]
    AutoDetect,
    /// `client_id` and `client_secret` as form parameters.
    InParams,
    /// `client_id` and `client_secret` as HTTP basic credentials.
    InHeader,
}

/// TLS options for the base transport.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Skip server certificate verification.
    pub insecure_skip_verify: bool,
    /// Name used to verify the server certificate instead of the URL host.
    pub server_name: String,
    /// Present a client certificate.
    pub tls_client_auth: bool,
    /// PEM encoded client certificate chain.
    pub tls_client_cert: Option<SecretString>,
    /// PEM encoded client private key.
    pub tls_client_key: Option<SecretString>,
    /// Verify the server against `tls_ca_cert` instead of the default roots.
    pub tls_auth_with_ca_cert: bool,
    /// PEM encoded CA bundle.
    pub tls_ca_cert: Option<SecretString>,
}

/// OAuth2 token exchange options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OAuth2Settings {
    pub oauth2_type: OAuth2Type,
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    /// Service account e-mail, used as the JWT issuer.
    pub email: String,
    pub private_key_id: String,
    pub private_key: Option<SecretString>,
    /// Optional JWT subject for domain-wide delegation.
    pub subject: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub auth_style: OAuth2AuthStyle,
    /// Extra form parameters sent to the token endpoint.
    pub endpoint_params: BTreeMap<String, String>,
}

/// AWS Signature Version 4 options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AwsSettings {
    pub region: String,
    pub service: String,
    pub access_key: Option<SecretString>,
    pub secret_key: Option<SecretString>,
}

/// Azure blob storage account.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AzureBlobSettings {
    /// Account URL; `%s` is replaced by the account name.
    pub account_url: String,
    pub account_name: String,
    pub account_key: Option<SecretString>,
}

/// Azure managed identity options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AzureIdentitySettings {
    /// Skip the instance metadata endpoint and go straight to the CLI credential.
    pub development_mode: bool,
}

/// Authenticated SOCKS5 relay the base transport can be routed through.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecureTunnelSettings {
    pub enabled: bool,
    /// `host:port` of the relay.
    pub address: String,
    pub username: String,
    pub password: Option<SecretString>,
}

/// Per-connection configuration.
///
/// Built once per data source and never mutated afterwards; the client keeps
/// its own copy.
///
/// # Examples
///
/// ```
/// use egress_common::{AuthenticationMethod, ConnectionSettings};
///
/// let settings: ConnectionSettings = serde_json::from_str(
///     r#"{ "url": "https://api.example.com", "basic_auth_enabled": true, "user_name": "u" }"#,
/// )
/// .unwrap();
///
/// assert_eq!(settings.effective_auth_method(), AuthenticationMethod::Basic);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub uid: String,
    pub name: String,
    /// Base URL prepended to every query URL.
    pub url: String,

    #[serde(rename = "auth_method")]
    pub authentication_method: Option<AuthenticationMethod>,
    pub basic_auth_enabled: bool,
    pub user_name: String,
    pub password: Option<SecretString>,
    pub forward_oauth_identity: bool,
    pub bearer_token: Option<SecretString>,
    pub api_key_key: String,
    pub api_key_type: ApiKeyLocation,
    pub api_key_value: Option<SecretString>,
    pub oauth2: OAuth2Settings,
    pub aws: AwsSettings,
    pub azure_blob: AzureBlobSettings,
    pub azure_identity: AzureIdentitySettings,

    pub tls: TlsSettings,
    pub proxy_type: ProxyMode,
    pub proxy_url: String,
    pub secure_tunnel: SecureTunnelSettings,
    pub timeout_in_seconds: u64,

    /// URL prefixes requests are restricted to. Empty allows everything.
    pub allowed_hosts: Vec<String>,
    /// Headers added to every request; values are treated as secrets.
    pub custom_headers: BTreeMap<String, SecretString>,
    /// Secrets referenced from queries as `${__qs.<name>}`.
    pub secure_query_fields: BTreeMap<String, SecretString>,
    pub is_mock: bool,
}

impl ConnectionSettings {
    /// Creates settings for the given base URL with everything else defaulted.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Returns the authentication method in force.
    ///
    /// When no method was stored, forwarded identity wins over basic
    /// authentication, which wins over none.
    #[must_use]
    pub fn effective_auth_method(&self) -> AuthenticationMethod {
        match self.authentication_method {
            Some(method) => method,
            None if self.forward_oauth_identity => AuthenticationMethod::ForwardOauth,
            None if self.basic_auth_enabled => AuthenticationMethod::Basic,
            None => AuthenticationMethod::None,
        }
    }

    /// Request timeout; zero falls back to [`DEFAULT_TIMEOUT`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        if self.timeout_in_seconds == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_secs(self.timeout_in_seconds)
        }
    }

    #[must_use]
    pub fn is_digest_auth_configured(&self) -> bool {
        self.effective_auth_method() == AuthenticationMethod::Digest
    }

    #[must_use]
    pub fn is_oauth_credentials_configured(&self) -> bool {
        self.effective_auth_method() == AuthenticationMethod::OAuth2
            && self.oauth2.oauth2_type == OAuth2Type::ClientCredentials
    }

    #[must_use]
    pub fn is_oauth_jwt_configured(&self) -> bool {
        self.effective_auth_method() == AuthenticationMethod::OAuth2
            && self.oauth2.oauth2_type == OAuth2Type::Jwt
    }

    #[must_use]
    pub fn is_aws_auth_configured(&self) -> bool {
        self.effective_auth_method() == AuthenticationMethod::Aws
    }

    /// Sets the authentication method explicitly.
    #[must_use]
    pub fn with_auth_method(mut self, method: AuthenticationMethod) -> Self {
        self.authentication_method = Some(method);
        self
    }

    /// Enables basic authentication with the given credentials.
    #[must_use]
    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth_enabled = true;
        self.user_name = user.into();
        self.password = Some(secret(password));
        self
    }

    /// Restricts requests to URLs starting with one of `hosts`.
    #[must_use]
    pub fn with_allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a named secret usable as `${__qs.<name>}` in queries.
    #[must_use]
    pub fn with_secure_query_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secure_query_fields.insert(name.into(), secret(value));
        self
    }

    /// Adds a header sent with every request.
    #[must_use]
    pub fn with_custom_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), secret(value));
        self
    }
}

/// Wraps a plain string into a [`SecretString`].
pub fn secret(value: impl Into<String>) -> SecretString {
    SecretString::new(value.into().into())
}

/// Exposes an optional secret, treating a missing one as empty.
#[must_use]
pub fn expose_or_empty(value: Option<&SecretString>) -> &str {
    value.map_or("", ExposeSecret::expose_secret)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn test_effective_auth_method_prefers_explicit_method() {
        let mut settings = ConnectionSettings::new("https://api.example.com");
        settings.basic_auth_enabled = true;
        settings.forward_oauth_identity = true;
        settings.authentication_method = Some(AuthenticationMethod::BearerToken);

        assert_eq!(
            settings.effective_auth_method(),
            AuthenticationMethod::BearerToken
        );
    }

    #[test]
    fn test_effective_auth_method_from_legacy_flags() {
        let mut settings = ConnectionSettings::default();
        assert_eq!(settings.effective_auth_method(), AuthenticationMethod::None);

        settings.basic_auth_enabled = true;
        assert_eq!(settings.effective_auth_method(), AuthenticationMethod::Basic);

        settings.forward_oauth_identity = true;
        assert_eq!(
            settings.effective_auth_method(),
            AuthenticationMethod::ForwardOauth
        );
    }

    #[test]
    fn test_timeout_defaults_to_sixty_seconds() {
        let mut settings = ConnectionSettings::default();
        assert_eq!(settings.timeout(), Duration::from_secs(60));

        settings.timeout_in_seconds = 5;
        assert_eq!(settings.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_decorator_predicates() {
        let mut settings =
            ConnectionSettings::new("https://api.example.com").with_auth_method(AuthenticationMethod::OAuth2);
        assert!(settings.is_oauth_credentials_configured());
        assert!(!settings.is_oauth_jwt_configured());

        settings.oauth2.oauth2_type = OAuth2Type::Jwt;
        assert!(settings.is_oauth_jwt_configured());
        assert!(!settings.is_oauth_credentials_configured());

        settings.oauth2.oauth2_type = OAuth2Type::Others;
        assert!(!settings.is_oauth_jwt_configured());
        assert!(!settings.is_oauth_credentials_configured());

        let settings = settings.with_auth_method(AuthenticationMethod::Digest);
        assert!(settings.is_digest_auth_configured());
        assert!(!settings.is_aws_auth_configured());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let settings: ConnectionSettings = toml::from_str(
            r#"
            url = "https://api.example.com"
            auth_method = "apiKey"
            api_key_key = "X-API-Key"
            api_key_type = "query"
            api_key_value = "k-123"
            allowed_hosts = ["https://api.example.com"]
            proxy_type = "none"
            timeout_in_seconds = 10

            [custom_headers]
            X-Tenant = "acme"

            [secure_query_fields]
            token = "s3cr3t"

            [oauth2]
            oauth2_type = "jwt"
            scopes = ["read", "write"]
            "#,
        )
        .unwrap();

        assert_eq!(settings.effective_auth_method(), AuthenticationMethod::ApiKey);
        assert_eq!(settings.api_key_type, ApiKeyLocation::Query);
        assert_eq!(expose_or_empty(settings.api_key_value.as_ref()), "k-123");
        assert_eq!(settings.proxy_type, ProxyMode::None);
        assert_eq!(settings.timeout(), Duration::from_secs(10));
        assert_eq!(settings.oauth2.oauth2_type, OAuth2Type::Jwt);
        assert_eq!(settings.oauth2.scopes, vec!["read", "write"]);
        assert_eq!(
            settings
                .secure_query_fields
                .get("token")
                .map(ExposeSecret::expose_secret),
            Some("s3cr3t")
        );
    }

    #[test]
    fn test_unknown_oauth2_type_maps_to_others() {
        let settings: ConnectionSettings =
            serde_json::from_str(r#"{ "oauth2": { "oauth2_type": "password" } }"#).unwrap();
        assert_eq!(settings.oauth2.oauth2_type, OAuth2Type::Others);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let settings = ConnectionSettings::new("https://api.example.com")
            .with_basic_auth("user", "super-secret")
            .with_custom_header("X-Api-Token", "header-secret");

        let debug_str = format!("{settings:?}");
        assert!(!debug_str.contains("super-secret"));
        assert!(!debug_str.contains("header-secret"));
    }

    #[test]
    fn test_auth_method_display_matches_serialized_name() {
        for name in [
            "none",
            "basicAuth",
            "bearerToken",
            "apiKey",
            "digestAuth",
            "oauth2",
            "aws",
            "azureBlob",
            "azureManagedIdentity",
            "oauthPassThru",
        ] {
            let method: AuthenticationMethod =
                serde_json::from_value(serde_json::Value::String(name.to_string())).unwrap();
            assert_eq!(method.to_string(), name);
        }
    }
}
