//! Error types for the request pipeline.
//!
//! Every failure is a [`ClientError`]. Before it reaches the caller it is
//! wrapped into a [`ClassifiedError`] that records which party is responsible
//! for it: the operator's settings, the remote endpoint, the caller, or this
//! library.

use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

use crate::auth::DecoratorError;
use crate::identity::IdentityError;

/// The party a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    /// The target endpoint or the network between us and it.
    Downstream,
    /// Invalid settings: TLS material, proxy, tunnel, credentials, URLs.
    Configuration,
    /// The caller cancelled the request.
    Cancelled,
    /// A state that should be unreachable.
    Internal,
}

impl ErrorSource {
    /// Whether the failure is reported to the caller as a query failure rather
    /// than as a settings problem.
    #[must_use]
    pub const fn surfaces_as_downstream(self) -> bool {
        !matches!(self, Self::Configuration)
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Downstream => write!(f, "downstream"),
            Self::Configuration => write!(f, "configuration"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Errors raised while building a client, assembling a request or executing it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The client certificate or key is missing or cannot be parsed.
    #[error("invalid client cert or key: {0}")]
    InvalidClientCertificate(String),

    /// The CA bundle contains no parsable certificate.
    #[error("invalid TLS CA certificate: {0}")]
    InvalidCaCertificate(String),

    /// The assembled TLS configuration was rejected.
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    /// The explicit proxy URL cannot be parsed.
    #[error("invalid proxy url '{url}': {reason}")]
    InvalidProxyUrl {
        /// The configured proxy URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The secure tunnel settings are malformed.
    #[error("error configuring secure socks proxy: {0}")]
    SecureTunnel(String),

    /// The Azure blob account name or key is unusable.
    #[error("invalid azure blob credentials: {0}")]
    InvalidBlobCredentials(String),

    /// An OAuth2, JWT or AWS credential is unusable.
    #[error("invalid {scheme} credentials: {reason}")]
    InvalidCredentials {
        /// Authentication scheme the credential belongs to.
        scheme: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// Neither the managed identity endpoint nor the CLI produced a token.
    #[error("failed to get azure token: {0}")]
    Identity(#[from] IdentityError),

    /// The underlying HTTP client could not be built.
    #[error("invalid http client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// URL, method or header cannot be turned into a request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The URL does not match any allowed host prefix.
    #[error(
        "requested URL is not allowed. To allow this URL, update the allowed hosts of the connection settings"
    )]
    UrlNotAllowed {
        /// The rejected URL.
        url: String,
    },

    /// No response was received.
    #[error("error getting response from url {url}. no response received. Error: {source}")]
    Network {
        /// Target URL.
        url: String,
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },

    /// A transport decorator failed before a response was produced.
    #[error("error getting response from url {url}: {source}")]
    Decorator {
        /// Target URL.
        url: String,
        /// Decorator failure.
        #[source]
        source: DecoratorError,
    },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The endpoint answered with a status of 400 or above.
    #[error("unsuccessful HTTP response status. {status}")]
    UnsuccessfulStatus {
        /// Response status.
        status: StatusCode,
    },

    /// The response body could not be read.
    #[error("error reading response body: {0}")]
    ResponseBody(#[source] reqwest::Error),

    /// The response body is not valid JSON.
    #[error("error parsing response body as JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// A failure whose origin cannot be determined.
    #[error("unexpected failure: {0}")]
    Internal(String),
}

impl ClientError {
    /// Attributes this error to the party responsible for it.
    #[must_use]
    pub const fn source_kind(&self) -> ErrorSource {
        match self {
            Self::InvalidClientCertificate(_)
            | Self::InvalidCaCertificate(_)
            | Self::Tls(_)
            | Self::InvalidProxyUrl { .. }
            | Self::SecureTunnel(_)
            | Self::InvalidBlobCredentials(_)
            | Self::InvalidCredentials { .. }
            | Self::Identity(_)
            | Self::HttpClient(_)
            | Self::InvalidRequest(_) => ErrorSource::Configuration,
            Self::Decorator { source, .. } => source.source_kind(),
            Self::Cancelled => ErrorSource::Cancelled,
            Self::Internal(_) => ErrorSource::Internal,
            Self::UrlNotAllowed { .. }
            | Self::Network { .. }
            | Self::UnsuccessfulStatus { .. }
            | Self::ResponseBody(_)
            | Self::InvalidJson(_) => ErrorSource::Downstream,
        }
    }

    /// HTTP status associated with the error, if a response was received.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::UnsuccessfulStatus { status } => Some(*status),
            Self::Network { source, .. } | Self::ResponseBody(source) => source.status(),
            _ => None,
        }
    }
}

/// A [`ClientError`] tagged with the party responsible for it.
#[derive(Debug, Error)]
#[error("{kind} error: {cause}")]
pub struct ClassifiedError {
    kind: ErrorSource,
    status: Option<StatusCode>,
    #[source]
    cause: ClientError,
}

impl ClassifiedError {
    /// Attribution of the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorSource {
        self.kind
    }

    /// HTTP status of the response that caused the failure, if any.
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The underlying error.
    #[must_use]
    pub const fn cause(&self) -> &ClientError {
        &self.cause
    }

    #[must_use]
    pub fn into_cause(self) -> ClientError {
        self.cause
    }

    #[must_use]
    pub const fn is_downstream(&self) -> bool {
        matches!(self.kind, ErrorSource::Downstream)
    }

    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self.kind, ErrorSource::Configuration)
    }
}

impl From<ClientError> for ClassifiedError {
    fn from(cause: ClientError) -> Self {
        Self {
            kind: cause.source_kind(),
            status: cause.status(),
            cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_classified() {
        let error = ClassifiedError::from(ClientError::InvalidProxyUrl {
            url: "::".to_string(),
            reason: "relative URL without a base".to_string(),
        });
        assert_eq!(error.kind(), ErrorSource::Configuration);
        assert!(error.is_configuration());
        assert!(error.status().is_none());
        assert!(!error.kind().surfaces_as_downstream());
    }

    #[test]
    fn test_status_errors_carry_status() {
        let error = ClassifiedError::from(ClientError::UnsuccessfulStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
        });
        assert!(error.is_downstream());
        assert_eq!(error.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(
            error.to_string(),
            "downstream error: unsuccessful HTTP response status. 503 Service Unavailable"
        );
    }

    #[test]
    fn test_cancelled_and_internal_surface_as_downstream() {
        let cancelled = ClassifiedError::from(ClientError::Cancelled);
        assert_eq!(cancelled.kind(), ErrorSource::Cancelled);
        assert!(cancelled.kind().surfaces_as_downstream());

        let internal = ClassifiedError::from(ClientError::Internal("boom".to_string()));
        assert_eq!(internal.kind(), ErrorSource::Internal);
        assert!(internal.kind().surfaces_as_downstream());
    }

    #[test]
    fn test_disallowed_url_is_downstream() {
        let error = ClassifiedError::from(ClientError::UrlNotAllowed {
            url: "https://evil.com/x".to_string(),
        });
        assert!(error.is_downstream());
    }
}
