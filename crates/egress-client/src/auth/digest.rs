//! HTTP digest authentication (RFC 7616).

use async_trait::async_trait;
use digest_auth::{AuthContext, HttpMethod};
use egress_common::{ConnectionSettings, expose_or_empty, secret};
use http::Extensions;
use http::header::{AUTHORIZATION, HeaderValue, WWW_AUTHENTICATE};
use reqwest::{Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};
use secrecy::{ExposeSecret, SecretString};

use super::{DecoratorError, DecoratorKind, TransportDecorator};

/// Answers a digest challenge and resends the request once.
pub struct DigestAuth {
    username: String,
    password: SecretString,
}

impl DigestAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: secret(password),
        }
    }

    #[must_use]
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self::new(
            settings.user_name.clone(),
            expose_or_empty(settings.password.as_ref()),
        )
    }

    fn authorization(
        &self,
        challenge: &str,
        request: &Request,
    ) -> std::result::Result<HeaderValue, DecoratorError> {
        let mut prompt = digest_auth::parse(challenge)
            .map_err(|e| DecoratorError::DigestChallenge(e.to_string()))?;

        let url = request.url();
        let uri = url.query().map_or_else(
            || url.path().to_string(),
            |query| format!("{}?{query}", url.path()),
        );
        let body = request.body().and_then(reqwest::Body::as_bytes);
        let context = AuthContext::new_with_method(
            self.username.as_str(),
            self.password.expose_secret(),
            uri,
            body,
            HttpMethod::from(request.method().as_str()),
        );

        let answer = prompt
            .respond(&context)
            .map_err(|e| DecoratorError::DigestChallenge(e.to_string()))?;
        HeaderValue::from_str(&answer.to_header_string())
            .map_err(|_| DecoratorError::InvalidHeader(DecoratorKind::Digest))
    }
}

/// First `WWW-Authenticate` value offering the digest scheme.
fn digest_challenge(response: &Response) -> Option<String> {
    response
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| {
            value
                .get(..7)
                .is_some_and(|scheme| scheme.eq_ignore_ascii_case("digest "))
        })
        .map(str::to_string)
}

#[async_trait]
impl Middleware for DigestAuth {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let replay = req.try_clone();
        let response = next.clone().run(req, extensions).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = digest_challenge(&response) else {
            return Ok(response);
        };
        let mut replay = replay.ok_or(DecoratorError::UnreplayableRequest)?;

        tracing::debug!(url = %replay.url(), "answering digest challenge");
        let authorization = self.authorization(&challenge, &replay)?;
        replay.headers_mut().insert(AUTHORIZATION, authorization);

        next.run(replay, extensions).await
    }
}

impl TransportDecorator for DigestAuth {
    fn kind(&self) -> DecoratorKind {
        DecoratorKind::Digest
    }
}
