use serde::Deserialize;
use typed_builder::TypedBuilder;

/// How the response body is expected to be interpreted downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ResponseType {
    #[default]
    Json,
    Csv,
    Xml,
    #[serde(rename = "graphql")]
    GraphQl,
    Uql,
    Groq,
}

/// Encoding of the request body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[non_exhaustive]
pub enum BodyType {
    /// Body sent verbatim.
    #[serde(rename = "raw")]
    Raw,
    /// `multipart/form-data` built from `body_form`.
    #[serde(rename = "form-data")]
    FormData,
    /// `application/x-www-form-urlencoded` built from `body_form`.
    #[serde(rename = "x-www-form-urlencoded")]
    UrlEncoded,
    /// JSON envelope with `query` and `variables`.
    #[serde(rename = "graphql")]
    GraphQl,
    /// Anything else: body sent verbatim as JSON.
    #[default]
    #[serde(other)]
    Unspecified,
}

/// A key/value pair used for headers, query parameters and form fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Method, parameters, headers and body of a query.
#[derive(Debug, Clone, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct UrlOptions {
    /// HTTP method; matched case-insensitively.
    #[builder(default = "GET".to_string(), setter(into))]
    pub method: String,
    /// Query string parameters appended in order.
    #[builder(default)]
    pub params: Vec<KeyValue>,
    /// Per-query headers; values may reference `${__qs.<name>}` secrets.
    #[builder(default)]
    pub headers: Vec<KeyValue>,
    #[builder(default)]
    pub body_type: BodyType,
    /// Content type sent with a raw body.
    #[builder(default, setter(into))]
    pub body_content_type: String,
    #[builder(default, setter(into))]
    pub body: String,
    #[builder(default)]
    pub body_form: Vec<KeyValue>,
    #[builder(default, setter(into))]
    pub body_graphql_query: String,
    /// GraphQL variables as a JSON object string.
    #[builder(default, setter(into))]
    pub body_graphql_variables: String,
}

impl Default for UrlOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl UrlOptions {
    /// Whether the method is `POST`, the only method that carries a body.
    #[must_use]
    pub fn is_post(&self) -> bool {
        self.method.eq_ignore_ascii_case("POST")
    }
}

/// A single request description supplied by the caller.
///
/// # Examples
///
/// ```
/// use egress_common::{BodyType, KeyValue, QueryDescriptor, ResponseType, UrlOptions};
///
/// let query = QueryDescriptor::builder()
///     .response_type(ResponseType::Json)
///     .url("/v1/items")
///     .url_options(
///         UrlOptions::builder()
///             .method("POST")
///             .body_type(BodyType::UrlEncoded)
///             .body_form(vec![KeyValue::new("a", "1")])
///             .build(),
///     )
///     .build();
///
/// assert!(query.url_options.is_post());
/// ```
#[derive(Debug, Clone, Default, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct QueryDescriptor {
    #[builder(default, setter(into))]
    pub ref_id: String,
    #[serde(rename = "type")]
    #[builder(default)]
    pub response_type: ResponseType,
    /// Appended to the connection's base URL.
    #[builder(setter(into))]
    pub url: String,
    #[builder(default)]
    pub url_options: UrlOptions,
}
