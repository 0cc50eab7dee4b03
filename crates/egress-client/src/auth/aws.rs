//! AWS Signature Version 4 request signing.

use std::time::SystemTime;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
use aws_sigv4::sign::v4;
use egress_common::{AwsSettings, expose_or_empty};
use http::Extensions;
use http::header::{HeaderName, HeaderValue};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};

use super::{DecoratorError, DecoratorKind, TransportDecorator};
use crate::error::ClientError;

/// Signs every request with static AWS credentials.
pub struct AwsSigV4 {
    credentials: Credentials,
    region: String,
    service: String,
}

impl AwsSigV4 {
    /// # Errors
    ///
    /// Returns a configuration error if the region or service is empty.
    pub fn from_settings(settings: &AwsSettings) -> Result<Self, ClientError> {
        if settings.region.is_empty() || settings.service.is_empty() {
            return Err(ClientError::InvalidCredentials {
                scheme: "aws",
                reason: "region and service are required".to_string(),
            });
        }
        Ok(Self {
            credentials: Credentials::new(
                expose_or_empty(settings.access_key.as_ref()),
                expose_or_empty(settings.secret_key.as_ref()),
                None,
                None,
                "egress-settings",
            ),
            region: settings.region.clone(),
            service: settings.service.clone(),
        })
    }

    fn sign(&self, request: &mut Request, time: SystemTime) -> Result<(), DecoratorError> {
        let identity = self.credentials.clone().into();
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(&self.service)
            .time(time)
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| DecoratorError::AwsSigning(e.to_string()))?
            .into();

        let body = match request.body() {
            None => SignableBody::Bytes(&[]),
            Some(body) => body
                .as_bytes()
                .map_or(SignableBody::UnsignedPayload, SignableBody::Bytes),
        };
        let headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value)));
        let signable = SignableRequest::new(
            request.method().as_str(),
            request.url().as_str(),
            headers,
            body,
        )
        .map_err(|e| DecoratorError::AwsSigning(e.to_string()))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| DecoratorError::AwsSigning(e.to_string()))?
            .into_parts();

        for (name, value) in instructions.headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| DecoratorError::InvalidHeader(DecoratorKind::AwsSigV4))?;
            let mut value = HeaderValue::from_str(value)
                .map_err(|_| DecoratorError::InvalidHeader(DecoratorKind::AwsSigV4))?;
            value.set_sensitive(name == http::header::AUTHORIZATION);
            request.headers_mut().insert(name, value);
        }
        Ok(())
    }
}

#[async_trait]
impl Middleware for AwsSigV4 {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        self.sign(&mut req, SystemTime::now())?;
        next.run(req, extensions).await
    }
}

impl TransportDecorator for AwsSigV4 {
    fn kind(&self) -> DecoratorKind {
        DecoratorKind::AwsSigV4
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use egress_common::secret;
    use wiremock::matchers::{header_exists, header_regex, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn settings() -> AwsSettings {
        AwsSettings {
            region: "us-east-1".to_string(),
            service: "execute-api".to_string(),
            access_key: Some(secret("AKIDEXAMPLE")),
            secret_key: Some(secret("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY")),
        }
    }

    #[test]
    fn test_region_and_service_are_required() {
        let mut settings = settings();
        settings.service.clear();
        assert!(matches!(
            AwsSigV4::from_settings(&settings),
            Err(ClientError::InvalidCredentials { scheme: "aws", .. })
        ));
    }

    #[test]
    fn test_signing_is_deterministic_for_a_fixed_time() {
        let signer = AwsSigV4::from_settings(&settings()).unwrap();
        let time = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);

        let mut first = Request::new(
            reqwest::Method::GET,
            "https://api.example.com/items?b=2&a=1".parse().unwrap(),
        );
        let mut second = first.try_clone().unwrap();
        signer.sign(&mut first, time).unwrap();
        signer.sign(&mut second, time).unwrap();

        let authorization = first.headers().get("authorization").unwrap();
        assert_eq!(Some(authorization), second.headers().get("authorization"));
        assert!(authorization.is_sensitive());
        assert!(
            authorization
                .to_str()
                .unwrap()
                .starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20231114/us-east-1/execute-api/aws4_request")
        );
        assert_eq!(
            first.headers().get("x-amz-date").unwrap(),
            "20231114T221320Z"
        );
    }

    #[tokio::test]
    async fn test_requests_are_signed() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header_exists("x-amz-date"))
            .and(header_regex(
                "authorization",
                r"^AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/\d{8}/us-east-1/execute-api/aws4_request, SignedHeaders=\S+, Signature=[0-9a-f]{64}$",
            ))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(AwsSigV4::from_settings(&settings()).unwrap())
            .build();

        let response = client
            .post(format!("{}/items", server.uri()))
            .body(r#"{"a":1}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
}
