//! Authentication decorators layered over the base transport.
//!
//! Each decorator is a [`reqwest_middleware::Middleware`]. They are applied in
//! a fixed order (digest, OAuth2 client credentials, OAuth2 JWT, AWS SigV4),
//! every stage wrapping whatever the previous one produced, so the last one
//! applied sees the request first.

use std::fmt;
use std::sync::Arc;

use egress_common::ConnectionSettings;
use reqwest_middleware::{ClientWithMiddleware, Middleware};
use thiserror::Error;

use crate::error::{ClientError, ErrorSource};
use crate::transport::BaseTransport;

pub mod aws;
pub mod digest;
pub mod oauth;

pub use aws::AwsSigV4;
pub use digest::DigestAuth;
pub use oauth::{OAuthClientCredentials, OAuthJwtBearer};

/// Failures raised by a decorator while handling a request.
///
/// Carried inside `reqwest_middleware::Error::Middleware` and recovered by
/// downcasting when the request result is classified.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecoratorError {
    /// The request body is a stream and cannot be sent twice.
    #[error("request cannot be replayed to answer the digest challenge")]
    UnreplayableRequest,

    /// The `WWW-Authenticate` digest challenge could not be answered.
    #[error("invalid digest challenge: {0}")]
    DigestChallenge(String),

    /// The token endpoint could not be reached or returned garbage.
    #[error("oauth2 token request to {token_url} failed: {reason}")]
    TokenRequest {
        token_url: String,
        reason: String,
    },

    /// The token endpoint refused the credentials.
    #[error("oauth2 token endpoint {token_url} returned {status}: {body}")]
    TokenRejected {
        token_url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    /// The JWT assertion could not be signed.
    #[error("failed to sign JWT assertion: {0}")]
    JwtSigning(#[from] jsonwebtoken::errors::Error),

    /// The request could not be signed with AWS SigV4.
    #[error("failed to sign request with AWS SigV4: {0}")]
    AwsSigning(String),

    /// A header value produced by the decorator is not valid.
    #[error("invalid header value produced by {0} decorator")]
    InvalidHeader(DecoratorKind),
}

impl DecoratorError {
    #[must_use]
    pub const fn source_kind(&self) -> ErrorSource {
        match self {
            Self::UnreplayableRequest
            | Self::DigestChallenge(_)
            | Self::TokenRequest { .. }
            | Self::TokenRejected { .. } => ErrorSource::Downstream,
            Self::JwtSigning(_) | Self::AwsSigning(_) | Self::InvalidHeader(_) => {
                ErrorSource::Configuration
            }
        }
    }
}

impl From<DecoratorError> for reqwest_middleware::Error {
    fn from(err: DecoratorError) -> Self {
        Self::middleware(err)
    }
}

/// Identifies a decorator in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoratorKind {
    Digest,
    OAuthClientCredentials,
    OAuthJwt,
    AwsSigV4,
}

impl fmt::Display for DecoratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digest => write!(f, "digest"),
            Self::OAuthClientCredentials => write!(f, "oauth2 client credentials"),
            Self::OAuthJwt => write!(f, "oauth2 jwt"),
            Self::AwsSigV4 => write!(f, "aws sigv4"),
        }
    }
}

/// A middleware that knows which decorator it is.
pub trait TransportDecorator: Middleware {
    fn kind(&self) -> DecoratorKind;
}

/// The base transport plus the decorators applied on top of it.
#[derive(Clone)]
pub struct TransportStack {
    base: BaseTransport,
    decorators: Vec<Arc<dyn TransportDecorator>>,
}

impl fmt::Debug for TransportStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportStack")
            .field("base", &self.base)
            .field("decorators", &self.kinds())
            .finish()
    }
}

impl TransportStack {
    #[must_use]
    pub const fn new(base: BaseTransport) -> Self {
        Self {
            base,
            decorators: Vec::new(),
        }
    }

    /// Wraps the current stack in `decorator`.
    pub fn push(&mut self, decorator: Arc<dyn TransportDecorator>) {
        tracing::debug!(decorator = %decorator.kind(), "applying transport decorator");
        self.decorators.push(decorator);
    }

    /// Decorators in application order, innermost first.
    #[must_use]
    pub fn kinds(&self) -> Vec<DecoratorKind> {
        self.decorators.iter().map(|d| d.kind()).collect()
    }

    #[must_use]
    pub fn contains(&self, kind: DecoratorKind) -> bool {
        self.decorators.iter().any(|d| d.kind() == kind)
    }

    #[must_use]
    pub const fn innermost(&self) -> &BaseTransport {
        &self.base
    }

    /// The base transport beneath every decorator.
    pub const fn innermost_mut(&mut self) -> &mut BaseTransport {
        &mut self.base
    }

    /// Builds the client: the base transport wrapped by every decorator, the
    /// last applied one outermost.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the base transport cannot be built.
    pub fn build(&self) -> Result<ClientWithMiddleware, ClientError> {
        let client = self.base.build()?;
        let builder = self
            .decorators
            .iter()
            .rev()
            .fold(reqwest_middleware::ClientBuilder::new(client), |builder, decorator| {
                let middleware: Arc<dyn Middleware> = Arc::clone(decorator) as Arc<dyn Middleware>;
                builder.with_arc(middleware)
            });
        Ok(builder.build())
    }
}

/// Applies every configured authentication decorator to `stack`, in order.
///
/// # Errors
///
/// Returns a configuration error if OAuth2 or AWS credentials are unusable.
pub fn apply_auth_decorators(
    stack: &mut TransportStack,
    settings: &ConnectionSettings,
) -> Result<(), ClientError> {
    if settings.is_digest_auth_configured() {
        stack.push(Arc::new(DigestAuth::from_settings(settings)));
    }

    if settings.is_oauth_credentials_configured() {
        let token_client = stack.innermost().build()?;
        stack.push(Arc::new(OAuthClientCredentials::from_settings(
            &settings.oauth2,
            token_client,
        )?));
    }

    if settings.is_oauth_jwt_configured() {
        let token_client = stack.innermost().build()?;
        stack.push(Arc::new(OAuthJwtBearer::from_settings(
            &settings.oauth2,
            token_client,
        )?));
    }

    if settings.is_aws_auth_configured() {
        stack.push(Arc::new(AwsSigV4::from_settings(&settings.aws)?));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use egress_common::{AuthenticationMethod, OAuth2Type, secret};

    use super::*;

    fn stack_for(settings: &ConnectionSettings) -> TransportStack {
        let mut stack = TransportStack::new(BaseTransport::from_settings(settings).unwrap());
        apply_auth_decorators(&mut stack, settings).unwrap();
        stack
    }

    #[test]
    fn test_no_decorators_by_default() {
        let settings = ConnectionSettings::new("https://api.example.com");
        let stack = stack_for(&settings);
        assert!(stack.kinds().is_empty());
        assert!(stack.build().is_ok());
    }

    #[test]
    fn test_digest_decorator_applied() {
        let settings = ConnectionSettings::new("https://api.example.com")
            .with_basic_auth("user", "pass")
            .with_auth_method(AuthenticationMethod::Digest);
        let stack = stack_for(&settings);
        assert_eq!(stack.kinds(), vec![DecoratorKind::Digest]);
    }

    #[test]
    fn test_aws_decorator_applied() {
        let mut settings = ConnectionSettings::new("https://api.example.com")
            .with_auth_method(AuthenticationMethod::Aws);
        settings.aws.region = "us-east-1".to_string();
        settings.aws.service = "execute-api".to_string();
        settings.aws.access_key = Some(secret("AKIDEXAMPLE"));
        settings.aws.secret_key = Some(secret("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY"));

        let stack = stack_for(&settings);
        assert!(stack.contains(DecoratorKind::AwsSigV4));
        assert!(!stack.contains(DecoratorKind::Digest));
    }

    #[test]
    fn test_oauth_decorators_follow_grant_type() {
        let mut settings = ConnectionSettings::new("https://api.example.com")
            .with_auth_method(AuthenticationMethod::OAuth2);
        settings.oauth2.token_url = "https://auth.example.com/token".to_string();
        settings.oauth2.client_id = "id".to_string();
        settings.oauth2.client_secret = Some(secret("secret"));
        assert_eq!(
            stack_for(&settings).kinds(),
            vec![DecoratorKind::OAuthClientCredentials]
        );

        settings.oauth2.oauth2_type = OAuth2Type::Others;
        assert!(stack_for(&settings).kinds().is_empty());
    }

    #[test]
    fn test_decorator_error_classification() {
        assert_eq!(
            DecoratorError::DigestChallenge("bad".to_string()).source_kind(),
            ErrorSource::Downstream
        );
        assert_eq!(
            DecoratorError::AwsSigning("bad".to_string()).source_kind(),
            ErrorSource::Configuration
        );
    }

    #[test]
    fn test_decorator_error_survives_middleware_wrapping() {
        let err: reqwest_middleware::Error = DecoratorError::UnreplayableRequest.into();
        let reqwest_middleware::Error::Middleware(inner) = err else {
            unreachable!("decorator errors are wrapped as middleware errors");
        };
        assert!(matches!(
            inner.downcast::<DecoratorError>().unwrap(),
            DecoratorError::UnreplayableRequest
        ));
    }
}
