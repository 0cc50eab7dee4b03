//! # egress-client
//!
//! Authenticated outbound HTTP requests for a single connection.
//!
//! A [`Client`] is built once per [`ConnectionSettings`](egress_common::ConnectionSettings):
//! - a base transport with the configured timeout, TLS material and proxy
//! - authentication decorators (digest, OAuth2 client credentials or JWT, AWS `SigV4`)
//! - an optional SOCKS5 secure tunnel
//!
//! Requests are assembled from a [`QueryDescriptor`](egress_common::QueryDescriptor),
//! checked against the connection's allow-list, executed and classified into an
//! [`ExecutionOutcome`].
//!
//! ## Example
//!
//! ```no_run
//! use egress_client::{CallerHeaders, Client, Payload};
//! use egress_common::{ConnectionSettings, QueryDescriptor};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = ConnectionSettings::new("https://api.example.com")
//!     .with_basic_auth("user", "password")
//!     .with_allowed_hosts(["https://api.example.com"]);
//! let client = Client::new(settings)?;
//!
//! let query = QueryDescriptor::builder().url("/v1/items").build();
//! let outcome = client
//!     .query(&query, &CallerHeaders::new(), &CancellationToken::new())
//!     .await;
//!
//! match outcome.result? {
//!     Payload::Json(value) => println!("{value}"),
//!     Payload::Text(text) => println!("{text}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod blob;
pub mod body;
pub mod client;
pub mod error;
pub mod headers;
pub mod identity;
pub mod request;
pub mod tls;
pub mod transport;
pub mod tunnel;

pub use auth::{DecoratorError, DecoratorKind, TransportDecorator, TransportStack};
pub use blob::BlobStorageTarget;
pub use client::{Client, ExecutionOutcome, Payload, can_allow_url, can_parse_as_json, strip_bom};
pub use error::{ClassifiedError, ClientError, ErrorSource};
pub use headers::{CallerHeaders, ID_TOKEN_HEADER};
pub use identity::{AzureIdentityResolver, IdentityError, TokenProvider};
pub use request::{PreparedRequest, RequestBuilder};
pub use transport::{BaseTransport, ProxyRoute};
