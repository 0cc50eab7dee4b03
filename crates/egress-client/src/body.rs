//! Request body encodings.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use egress_common::{BodyType, KeyValue, UrlOptions};
use serde_json::{Map, Value, json};
use url::form_urlencoded;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// A body and the content type that describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub bytes: Bytes,
    /// `None` leaves `Content-Type` unset.
    pub content_type: Option<String>,
}

/// Encodes the body described by `options`.
///
/// Only `POST` requests carry a body; every other method yields `None`.
#[must_use]
pub fn encode_body(options: &UrlOptions) -> Option<EncodedBody> {
    if !options.is_post() {
        return None;
    }

    let body = match options.body_type {
        BodyType::Raw => EncodedBody {
            bytes: Bytes::from(options.body.clone()),
            content_type: (!options.body_content_type.is_empty())
                .then(|| options.body_content_type.clone()),
        },
        BodyType::FormData => {
            let boundary = uuid::Uuid::new_v4().simple().to_string();
            EncodedBody {
                bytes: multipart_form(&options.body_form, &boundary),
                content_type: Some(format!("multipart/form-data; boundary={boundary}")),
            }
        }
        BodyType::UrlEncoded => EncodedBody {
            bytes: Bytes::from(url_encoded_form(&options.body_form)),
            content_type: Some(CONTENT_TYPE_FORM_URLENCODED.to_string()),
        },
        BodyType::GraphQl => EncodedBody {
            bytes: Bytes::from(graphql_envelope(
                &options.body_graphql_query,
                &options.body_graphql_variables,
            )),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
        },
        _ => EncodedBody {
            bytes: Bytes::from(options.body.clone()),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
        },
    };
    Some(body)
}

/// `multipart/form-data` with one text part per field.
fn multipart_form(fields: &[KeyValue], boundary: &str) -> Bytes {
    let mut buf = BytesMut::new();
    for field in fields {
        buf.put_slice(format!("--{boundary}\r\n").as_bytes());
        buf.put_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                escape_quotes(&field.key)
            )
            .as_bytes(),
        );
        buf.put_slice(field.value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(format!("--{boundary}--\r\n").as_bytes());
    buf.freeze()
}

fn escape_quotes(name: &str) -> String {
    name.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Last value per key wins; keys are emitted in sorted order.
fn url_encoded_form(fields: &[KeyValue]) -> String {
    let form: BTreeMap<&str, &str> = fields
        .iter()
        .map(|field| (field.key.as_str(), field.value.as_str()))
        .collect();
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(form)
        .finish()
}

fn graphql_envelope(query: &str, variables: &str) -> String {
    let variables = if variables.trim().is_empty() {
        Value::Null
    } else {
        match serde_json::from_str::<Map<String, Value>>(variables) {
            Ok(map) => Value::Object(map),
            Err(e) => {
                tracing::error!(error = %e, "error parsing graphql variables json");
                Value::Null
            }
        }
    };
    json!({ "query": query, "variables": variables }).to_string()
}
