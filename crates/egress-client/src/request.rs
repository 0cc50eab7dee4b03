//! Assembly of the outgoing request from connection settings and a query.
//!
//! The same path produces the request that goes on the wire
//! ([`RenderMode::WithSecrets`]) and the one shown to users
//! ([`RenderMode::Redacted`]), so the two never drift apart.

use std::fmt;

use bytes::Bytes;
use egress_common::{
    ApiKeyLocation, AuthenticationMethod, ConnectionSettings, QueryDescriptor, REDACTED_PLACEHOLDER,
    RenderMode, interpolate_secure_fields,
};
use http::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::Method;
use secrecy::ExposeSecret;
use url::{Url, form_urlencoded};

use crate::body::encode_body;
use crate::error::ClientError;
use crate::headers::{
    CallerHeaders, apply_accept, apply_content_type, apply_query_headers, apply_settings_headers,
    apply_static_auth,
};
use crate::identity::AzureIdentityResolver;

/// A fully assembled request.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    /// The URL exactly as assembled, before parsing normalises the host and
    /// port. The allow-list is checked against this.
    pub target: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl PreparedRequest {
    #[must_use]
    pub fn into_reqwest(self) -> reqwest::Request {
        let mut request = reqwest::Request::new(self.method, self.url);
        *request.headers_mut() = self.headers;
        *request.body_mut() = self.body.map(reqwest::Body::from);
        request
    }
}

/// Renders the request in a readable form: request line, headers, body.
impl fmt::Display for PreparedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.method, self.url)?;
        for (name, value) in &self.headers {
            writeln!(f, "{name}: {}", String::from_utf8_lossy(value.as_bytes()))?;
        }
        if let Some(body) = &self.body {
            writeln!(f)?;
            write!(f, "{}", String::from_utf8_lossy(body))?;
        }
        Ok(())
    }
}

/// Joins the connection base URL and the query URL.
///
/// A query URL that already starts with the base URL is used as is.
#[must_use]
pub fn join_url(base: &str, query_url: &str) -> String {
    if query_url.starts_with(base) {
        query_url.to_string()
    } else {
        format!("{base}{query_url}")
    }
}

fn parse_method(method: &str) -> Result<Method, ClientError> {
    if method.is_empty() {
        return Ok(Method::GET);
    }
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| ClientError::InvalidRequest(format!("invalid method '{method}'")))
}

fn build_url(
    settings: &ConnectionSettings,
    query: &QueryDescriptor,
    mode: RenderMode,
) -> Result<(Url, String), ClientError> {
    let fields = &settings.secure_query_fields;
    let mut target = interpolate_secure_fields(&join_url(&settings.url, &query.url), fields, mode);

    let mut pairs: Vec<(&str, String)> = query
        .url_options
        .params
        .iter()
        .filter(|param| !param.key.is_empty())
        .map(|param| {
            (
                param.key.as_str(),
                interpolate_secure_fields(&param.value, fields, mode),
            )
        })
        .collect();
    if settings.effective_auth_method() == AuthenticationMethod::ApiKey
        && settings.api_key_type == ApiKeyLocation::Query
        && !settings.api_key_key.is_empty()
    {
        pairs.push((
            settings.api_key_key.as_str(),
            mode.reveal(settings.api_key_value.as_ref()),
        ));
    }

    if !pairs.is_empty() {
        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        match target.find('?') {
            None => target.push('?'),
            Some(at) if at + 1 < target.len() && !target.ends_with('&') => target.push('&'),
            Some(_) => {}
        }
        target.push_str(&encoded);
    }

    let url = Url::parse(&target).map_err(|e| {
        let shown = if mode.includes_secrets() {
            build_url(settings, query, RenderMode::Redacted)
                .map_or_else(|_| String::from("<redacted>"), |(_, shown)| shown)
        } else {
            target.clone()
        };
        ClientError::InvalidRequest(format!("invalid url '{shown}': {e}"))
    })?;
    Ok((url, target))
}

/// Turns queries into [`PreparedRequest`]s for one connection.
#[derive(Debug, Clone, Copy)]
pub struct RequestBuilder<'a> {
    settings: &'a ConnectionSettings,
    identity: Option<&'a AzureIdentityResolver>,
}

impl<'a> RequestBuilder<'a> {
    #[must_use]
    pub const fn new(settings: &'a ConnectionSettings) -> Self {
        Self {
            settings,
            identity: None,
        }
    }

    /// Resolver used for the Azure managed identity method.
    #[must_use]
    pub const fn with_identity(mut self, identity: Option<&'a AzureIdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    /// Assembles the request for `query`.
    ///
    /// Headers are applied in a fixed order: `Accept`, `Content-Type`, the
    /// connection's custom headers, the query's headers, then the single
    /// authorization header of the effective method.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if the method, URL or a header
    /// is invalid.
    pub async fn build(
        &self,
        query: &QueryDescriptor,
        caller: &CallerHeaders,
        mode: RenderMode,
    ) -> Result<PreparedRequest, ClientError> {
        let options = &query.url_options;
        let method = parse_method(&options.method)?;
        let (url, target) = build_url(self.settings, query, mode)?;
        let body = encode_body(options);

        let mut headers = HeaderMap::new();
        apply_accept(&mut headers, query.response_type);
        apply_content_type(
            &mut headers,
            body.as_ref().and_then(|b| b.content_type.as_deref()),
        )?;
        apply_settings_headers(&mut headers, self.settings, mode)?;
        apply_query_headers(&mut headers, options, self.settings, mode)?;
        apply_static_auth(&mut headers, self.settings, caller, mode)?;
        if self.settings.effective_auth_method() == AuthenticationMethod::AzureManagedIdentity {
            self.apply_managed_identity(&mut headers, mode).await;
        }

        Ok(PreparedRequest {
            method,
            url,
            target,
            headers,
            body: body.map(|b| b.bytes),
        })
    }

    /// Adds the managed identity bearer token. A missing token is logged and
    /// the request goes out without it.
    async fn apply_managed_identity(&self, headers: &mut HeaderMap, mode: RenderMode) {
        let token = if mode.includes_secrets() {
            let Some(identity) = self.identity else {
                tracing::warn!("no azure identity resolver configured, sending request without token");
                return;
            };
            match identity.get_token().await {
                Ok(token) => token.expose_secret().to_string(),
                Err(e) => {
                    let err = ClientError::from(e);
                    tracing::error!(error = %err, kind = %err.source_kind(), "failed to get azure token");
                    return;
                }
            }
        } else {
            REDACTED_PLACEHOLDER.to_string()
        };

        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.append(AUTHORIZATION, value);
                tracing::debug!("authorization header set from azure identity");
            }
            Err(_) => tracing::error!("azure token is not a valid header value"),
        }
    }
}
