//! # egress-common
//!
//! Shared data model for the egress request pipeline.
//!
//! This crate provides the types the pipeline consumes:
//! - [`ConnectionSettings`]: per-connection endpoint, TLS, proxy and credential configuration
//! - [`QueryDescriptor`]: a single request description (URL, method, body, headers)
//! - [`RenderMode`]: whether an assembled request carries real secrets or the
//!   [`REDACTED_PLACEHOLDER`]
//!
//! ## Example
//!
//! ```
//! use egress_common::{ConnectionSettings, QueryDescriptor, RenderMode, interpolate_secure_fields};
//!
//! let settings = ConnectionSettings::new("https://api.example.com")
//!     .with_secure_query_field("token", "s3cr3t");
//!
//! let query = QueryDescriptor::builder().url("/items?key=${__qs.token}").build();
//!
//! let preview = interpolate_secure_fields(
//!     &query.url,
//!     &settings.secure_query_fields,
//!     RenderMode::Redacted,
//! );
//! assert_eq!(preview, "/items?key=xxxxxxxx");
//! ```

/// Query descriptor types.
///
/// Describes the target URL, method, headers and body of one request.
pub mod query;
/// Real versus redacted rendering of secrets.
pub mod render;
/// Connection settings.
///
/// Endpoint, TLS, proxy, tunnel and per-scheme credential configuration.
pub mod settings;

pub use query::{BodyType, KeyValue, QueryDescriptor, ResponseType, UrlOptions};
pub use render::{REDACTED_PLACEHOLDER, RenderMode, interpolate_secure_fields};
pub use settings::{
    ApiKeyLocation, AuthenticationMethod, AwsSettings, AzureBlobSettings, AzureIdentitySettings,
    ConnectionSettings, DEFAULT_TIMEOUT, OAuth2AuthStyle, OAuth2Settings, OAuth2Type, ProxyMode,
    SecureTunnelSettings, TlsSettings, expose_or_empty, secret,
};
