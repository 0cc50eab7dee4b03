//! The per-connection client: construction, allow-list check, execution and
//! classification of results.

use std::sync::Arc;
use std::time::{Duration, Instant};

use egress_common::{AuthenticationMethod, ConnectionSettings, QueryDescriptor, RenderMode, ResponseType};
use http::header::{CONTENT_TYPE, HeaderMap};
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::auth::{DecoratorError, DecoratorKind, TransportStack, apply_auth_decorators};
use crate::blob::BlobStorageTarget;
use crate::error::{ClassifiedError, ClientError, ErrorSource};
use crate::headers::CallerHeaders;
use crate::identity::AzureIdentityResolver;
use crate::request::{PreparedRequest, RequestBuilder};
use crate::transport::BaseTransport;
use crate::tunnel::apply_secure_tunnel;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Whether `url` is permitted by the allow-list.
///
/// An empty list allows everything; otherwise some entry must be a string
/// prefix of `url`.
#[must_use]
pub fn can_allow_url(url: &str, allowed_hosts: &[String]) -> bool {
    allowed_hosts.is_empty() || allowed_hosts.iter().any(|host| url.starts_with(host.as_str()))
}

/// Whether a successful response body is decoded as JSON.
#[must_use]
pub fn can_parse_as_json(response_type: ResponseType, headers: &HeaderMap) -> bool {
    match response_type {
        ResponseType::Json | ResponseType::GraphQl => true,
        ResponseType::Uql | ResponseType::Groq => headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.to_ascii_lowercase().contains("application/json")),
        _ => false,
    }
}

/// Drops a leading UTF-8 byte order mark.
#[must_use]
pub fn strip_bom(body: &[u8]) -> &[u8] {
    body.strip_prefix(UTF8_BOM).unwrap_or(body)
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

/// Result of executing one request.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub result: Result<Payload, ClassifiedError>,
    /// Response status, or `0` when no response was received.
    pub status_code: u16,
    pub duration: Duration,
}

impl ExecutionOutcome {
    fn failed(cause: ClientError, status_code: u16, duration: Duration) -> Self {
        let error = ClassifiedError::from(cause);
        if error.kind() == ErrorSource::Internal {
            tracing::error!(error = %error, "unexpected failure while executing request");
        }
        Self {
            result: Err(error),
            status_code,
            duration,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Maps a failure of the middleware chain to a [`ClientError`].
fn classify_send_error(err: reqwest_middleware::Error, url: &str) -> ClientError {
    match err {
        reqwest_middleware::Error::Reqwest(source) if source.is_builder() => {
            ClientError::InvalidRequest(source.to_string())
        }
        reqwest_middleware::Error::Reqwest(source) => ClientError::Network {
            url: url.to_string(),
            source,
        },
        reqwest_middleware::Error::Middleware(err) => match err.downcast::<DecoratorError>() {
            Ok(source) => ClientError::Decorator {
                url: url.to_string(),
                source,
            },
            Err(err) => match err.downcast::<reqwest::Error>() {
                Ok(source) => ClientError::Network {
                    url: url.to_string(),
                    source,
                },
                Err(other) => ClientError::Internal(format!("{other:#}")),
            },
        },
    }
}

/// An HTTP client bound to one set of connection settings.
///
/// Cheap to share: the settings and the middleware stack are reference counted.
#[derive(Debug, Clone)]
pub struct Client {
    settings: Arc<ConnectionSettings>,
    http: ClientWithMiddleware,
    decorators: Vec<DecoratorKind>,
    identity: Option<Arc<AzureIdentityResolver>>,
    blob: Option<BlobStorageTarget>,
}

impl Client {
    /// Builds the transport, the decorator chain and the secure tunnel for
    /// `settings`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid TLS material, proxy, tunnel,
    /// OAuth2, AWS or blob settings.
    #[tracing::instrument(
        name = "client.new",
        skip_all,
        fields(uid = %settings.uid, name = %settings.name, auth = %settings.effective_auth_method()),
        err
    )]
    pub fn new(settings: ConnectionSettings) -> Result<Self, ClassifiedError> {
        Ok(Self::build(settings)?)
    }

    fn build(settings: ConnectionSettings) -> Result<Self, ClientError> {
        let mut stack = TransportStack::new(BaseTransport::from_settings(&settings)?);
        // The route must be final before OAuth decorators clone the base
        // transport for their token requests.
        apply_secure_tunnel(&mut stack, &settings)?;
        apply_auth_decorators(&mut stack, &settings)?;
        let http = stack.build()?;

        let identity = match settings.effective_auth_method() {
            AuthenticationMethod::AzureManagedIdentity => {
                let metadata_client = reqwest::Client::builder()
                    .no_proxy()
                    .build()
                    .map_err(ClientError::HttpClient)?;
                Some(Arc::new(AzureIdentityResolver::from_settings(
                    &settings.azure_identity,
                    metadata_client,
                )))
            }
            _ => None,
        };

        let blob = match settings.effective_auth_method() {
            AuthenticationMethod::AzureBlob => Some(
                BlobStorageTarget::from_settings(&settings.azure_blob).inspect_err(|e| {
                    tracing::error!(error = %e, "invalid azure blob credentials");
                })?,
            ),
            _ => None,
        };

        if settings.is_mock {
            tracing::debug!("client created in mock mode");
        }
        tracing::debug!(decorators = ?stack.kinds(), "client created");

        Ok(Self {
            decorators: stack.kinds(),
            settings: Arc::new(settings),
            http,
            identity,
            blob,
        })
    }

    /// Replaces the Azure identity resolver, e.g. with different providers.
    #[must_use]
    pub fn with_identity_resolver(mut self, resolver: AzureIdentityResolver) -> Self {
        self.identity = Some(Arc::new(resolver));
        self
    }

    #[must_use]
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    #[must_use]
    pub fn is_mock(&self) -> bool {
        self.settings.is_mock
    }

    /// Decorators wrapping the base transport, innermost first.
    #[must_use]
    pub fn decorators(&self) -> &[DecoratorKind] {
        &self.decorators
    }

    #[must_use]
    pub const fn blob_target(&self) -> Option<&BlobStorageTarget> {
        self.blob.as_ref()
    }

    /// Assembles the request for `query` without sending it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the method, URL or a header is invalid.
    pub async fn prepare(
        &self,
        query: &QueryDescriptor,
        caller: &CallerHeaders,
        mode: RenderMode,
    ) -> Result<PreparedRequest, ClassifiedError> {
        RequestBuilder::new(&self.settings)
            .with_identity(self.identity.as_deref())
            .build(query, caller, mode)
            .await
            .map_err(ClassifiedError::from)
    }

    /// Assembles and executes `query`.
    pub async fn query(
        &self,
        query: &QueryDescriptor,
        caller: &CallerHeaders,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let prepared = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return ExecutionOutcome::failed(ClientError::Cancelled, 0, Duration::ZERO);
            }
            prepared = self.prepare(query, caller, RenderMode::WithSecrets) => prepared,
        };

        match prepared {
            Ok(request) => self.execute(request, query.response_type, cancel).await,
            Err(error) => {
                tracing::error!(error = %error, "failed to create request");
                ExecutionOutcome {
                    result: Err(error),
                    status_code: 0,
                    duration: Duration::ZERO,
                }
            }
        }
    }

    /// Sends an assembled request and classifies the result.
    ///
    /// Requests to URLs outside the allow-list fail without touching the
    /// network.
    pub async fn execute(
        &self,
        request: PreparedRequest,
        response_type: ResponseType,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let url = request.target.clone();
        if !can_allow_url(&url, &self.settings.allowed_hosts) {
            tracing::error!(
                host = request.url.host_str().unwrap_or_default(),
                url_path = request.url.path(),
                "url is not in the allowed list, make sure the base url matches the connection settings"
            );
            return ExecutionOutcome::failed(ClientError::UrlNotAllowed { url }, 0, Duration::ZERO);
        }

        let span = tracing::info_span!(
            "client.req",
            host = request.url.host_str().unwrap_or_default(),
            url_path = request.url.path(),
            method = %request.method,
            r#type = ?response_type,
        );
        self.send(request, &url, response_type, cancel)
            .instrument(span)
            .await
    }

    async fn send(
        &self,
        request: PreparedRequest,
        url: &str,
        response_type: ResponseType,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        tracing::debug!("requesting url");
        let start = Instant::now();
        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("request cancelled");
                return ExecutionOutcome::failed(ClientError::Cancelled, 0, start.elapsed());
            }
            sent = self.http.execute(request.into_reqwest()) => sent,
        };
        let duration = start.elapsed();
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                let cause = classify_send_error(err, url);
                tracing::error!(error = %cause, duration_ms, "error getting response from server, no response received");
                return ExecutionOutcome::failed(cause, 0, duration);
            }
        };

        let status = response.status();
        tracing::debug!(status = status.as_u16(), duration_ms, "received response");
        if status.is_client_error() || status.is_server_error() {
            return ExecutionOutcome::failed(
                ClientError::UnsuccessfulStatus { status },
                status.as_u16(),
                duration,
            );
        }

        let as_json = can_parse_as_json(response_type, response.headers());
        let body = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("request cancelled while reading body");
                return ExecutionOutcome::failed(ClientError::Cancelled, status.as_u16(), duration);
            }
            body = response.bytes() => body,
        };
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = %err, "error reading response body");
                return ExecutionOutcome::failed(ClientError::ResponseBody(err), status.as_u16(), duration);
            }
        };
        let body = strip_bom(&body);

        let result = if as_json {
            serde_json::from_slice(body).map(Payload::Json).map_err(|e| {
                tracing::error!(error = %e, "error parsing response body as json");
                ClassifiedError::from(ClientError::InvalidJson(e))
            })
        } else {
            Ok(Payload::Text(String::from_utf8_lossy(body).into_owned()))
        };

        ExecutionOutcome {
            result,
            status_code: status.as_u16(),
            duration,
        }
    }
}
