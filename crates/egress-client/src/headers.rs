//! Header assembly for outgoing requests.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use egress_common::{
    ApiKeyLocation, AuthenticationMethod, ConnectionSettings, RenderMode, ResponseType, UrlOptions,
    expose_or_empty, interpolate_secure_fields,
};
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use crate::error::ClientError;

/// Header carrying the caller's OpenID identity token.
pub const ID_TOKEN_HEADER: &str = "X-ID-Token";

/// Headers of the inbound call, used when forwarding the caller's identity.
pub type CallerHeaders = BTreeMap<String, String>;

/// `Accept` value for a response type.
#[must_use]
pub const fn accept_header(response_type: ResponseType) -> Option<&'static str> {
    match response_type {
        ResponseType::Json | ResponseType::GraphQl => Some("application/json;q=0.9,text/plain"),
        ResponseType::Csv => Some("text/csv; charset=utf-8"),
        ResponseType::Xml => Some("text/xml;q=0.9,text/plain"),
        _ => None,
    }
}

fn header_name(key: &str) -> Result<HeaderName, ClientError> {
    HeaderName::from_bytes(key.as_bytes())
        .map_err(|_| ClientError::InvalidRequest(format!("invalid header name '{key}'")))
}

fn header_value(key: &str, value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value)
        .map_err(|_| ClientError::InvalidRequest(format!("invalid value for header '{key}'")))
}

fn sensitive_value(key: &str, value: &str) -> Result<HeaderValue, ClientError> {
    let mut value = header_value(key, value)?;
    value.set_sensitive(true);
    Ok(value)
}

/// Appends a user supplied header; `Accept` and `Content-Type` replace instead.
fn add_user_header(headers: &mut HeaderMap, key: &str, value: HeaderValue) -> Result<(), ClientError> {
    let name = header_name(key)?;
    if name == ACCEPT || name == CONTENT_TYPE {
        headers.insert(name, value);
    } else {
        headers.append(name, value);
    }
    Ok(())
}

/// Case-insensitive lookup in the caller's headers.
fn caller_header<'a>(caller: &'a CallerHeaders, name: &str) -> Option<&'a str> {
    caller
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

pub(crate) fn apply_accept(headers: &mut HeaderMap, response_type: ResponseType) {
    if let Some(accept) = accept_header(response_type) {
        headers.insert(ACCEPT, HeaderValue::from_static(accept));
    }
}

pub(crate) fn apply_content_type(
    headers: &mut HeaderMap,
    content_type: Option<&str>,
) -> Result<(), ClientError> {
    if let Some(content_type) = content_type {
        headers.insert(CONTENT_TYPE, header_value("Content-Type", content_type)?);
    }
    Ok(())
}

/// Headers configured on the connection; every value is a secret.
pub(crate) fn apply_settings_headers(
    headers: &mut HeaderMap,
    settings: &ConnectionSettings,
    mode: RenderMode,
) -> Result<(), ClientError> {
    for (key, value) in &settings.custom_headers {
        if key.is_empty() {
            continue;
        }
        let value = sensitive_value(key, &mode.reveal(Some(value)))?;
        add_user_header(headers, key, value)?;
    }
    Ok(())
}

/// Headers declared on the query, with secure fields resolved.
pub(crate) fn apply_query_headers(
    headers: &mut HeaderMap,
    options: &UrlOptions,
    settings: &ConnectionSettings,
    mode: RenderMode,
) -> Result<(), ClientError> {
    for header in &options.headers {
        if header.key.is_empty() {
            continue;
        }
        let value = if mode.includes_secrets() {
            header_value(
                &header.key,
                &interpolate_secure_fields(&header.value, &settings.secure_query_fields, mode),
            )?
        } else {
            sensitive_value(&header.key, &mode.reveal_str(&header.value))?
        };
        add_user_header(headers, &header.key, value)?;
    }
    Ok(())
}

/// `Basic` credentials, or `None` when both user and password are empty.
#[must_use]
pub fn basic_authorization(user: &str, password: &str, mode: RenderMode) -> Option<String> {
    if user.is_empty() && password.is_empty() {
        return None;
    }
    let credentials = STANDARD.encode(format!("{user}:{password}"));
    Some(format!("Basic {}", mode.reveal_str(&credentials)))
}

/// The primary authorization header for every method resolved without I/O.
///
/// Azure managed identity is handled by the request builder since it needs a
/// token fetch.
pub(crate) fn apply_static_auth(
    headers: &mut HeaderMap,
    settings: &ConnectionSettings,
    caller: &CallerHeaders,
    mode: RenderMode,
) -> Result<(), ClientError> {
    match settings.effective_auth_method() {
        AuthenticationMethod::Basic => {
            let password = expose_or_empty(settings.password.as_ref());
            if let Some(value) = basic_authorization(&settings.user_name, password, mode) {
                headers.insert(AUTHORIZATION, sensitive_value("Authorization", &value)?);
            }
        }
        AuthenticationMethod::BearerToken => {
            let value = format!("Bearer {}", mode.reveal(settings.bearer_token.as_ref()));
            headers.append(AUTHORIZATION, sensitive_value("Authorization", &value)?);
        }
        AuthenticationMethod::ApiKey
            if settings.api_key_type == ApiKeyLocation::Header && !settings.api_key_key.is_empty() =>
        {
            let value = mode.reveal(settings.api_key_value.as_ref());
            headers.append(
                header_name(&settings.api_key_key)?,
                sensitive_value(&settings.api_key_key, &value)?,
            );
        }
        AuthenticationMethod::ForwardOauth => {
            let authorization = caller_header(caller, "Authorization").unwrap_or_default();
            headers.append(
                AUTHORIZATION,
                sensitive_value("Authorization", &mode.reveal_str(authorization))?,
            );
            if let Some(id_token) = caller_header(caller, ID_TOKEN_HEADER).filter(|t| !t.is_empty()) {
                headers.append(
                    HeaderName::from_static("x-id-token"),
                    sensitive_value(ID_TOKEN_HEADER, &mode.reveal_str(id_token))?,
                );
            }
        }
        _ => {}
    }
    Ok(())
}
