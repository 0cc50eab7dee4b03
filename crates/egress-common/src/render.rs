//! Real versus redacted rendering of secret material.

use std::collections::BTreeMap;

use secrecy::{ExposeSecret, SecretString};

/// Literal substituted for every secret when rendering in [`RenderMode::Redacted`].
pub const REDACTED_PLACEHOLDER: &str = "xxxxxxxx";

/// Controls whether assembled requests carry real secrets.
///
/// `Redacted` is used to show a fully assembled request to a user (preview,
/// validation) without disclosing credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderMode {
    /// Secrets are rendered as-is; used for requests that go on the wire.
    WithSecrets,
    /// Every secret is replaced by [`REDACTED_PLACEHOLDER`].
    Redacted,
}

impl RenderMode {
    #[must_use]
    pub const fn includes_secrets(self) -> bool {
        matches!(self, Self::WithSecrets)
    }

    /// Renders a single secret value.
    #[must_use]
    pub fn reveal(self, secret: Option<&SecretString>) -> String {
        match self {
            Self::WithSecrets => secret.map(ExposeSecret::expose_secret).unwrap_or_default().to_string(),
            Self::Redacted => REDACTED_PLACEHOLDER.to_string(),
        }
    }

    /// Renders a value that is secret by context, such as a forwarded header.
    #[must_use]
    pub fn reveal_str(self, value: &str) -> String {
        match self {
            Self::WithSecrets => value.to_string(),
            Self::Redacted => REDACTED_PLACEHOLDER.to_string(),
        }
    }
}

/// Replaces every `${__qs.<name>}` reference in `input` with the named secure
/// query field, or with the placeholder in redacted mode.
///
/// References to names that are not configured are left untouched. Substituted
/// values are never scanned again.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use egress_common::{RenderMode, interpolate_secure_fields, secret};
///
/// let mut fields = BTreeMap::new();
/// fields.insert("token".to_string(), secret("abc"));
///
/// let input = "https://api.example.com/?key=${__qs.token}";
/// assert_eq!(
///     interpolate_secure_fields(input, &fields, RenderMode::WithSecrets),
///     "https://api.example.com/?key=abc"
/// );
/// assert_eq!(
///     interpolate_secure_fields(input, &fields, RenderMode::Redacted),
///     "https://api.example.com/?key=xxxxxxxx"
/// );
/// ```
#[must_use]
pub fn interpolate_secure_fields(
    input: &str,
    fields: &BTreeMap<String, SecretString>,
    mode: RenderMode,
) -> String {
    const OPEN: &str = "${__qs.";

    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        output.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let field = after
            .find('}')
            .and_then(|end| fields.get(&after[..end]).map(|value| (end, value)));
        match field {
            Some((end, value)) => {
                output.push_str(&mode.reveal(Some(value)));
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(OPEN);
                rest = after;
            }
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use proptest::prelude::*;

    use super::*;
    use crate::secret;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, SecretString> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), secret(*value)))
            .collect()
    }

    #[test]
    fn test_reveal() {
        let value = secret("hunter2");
        assert_eq!(RenderMode::WithSecrets.reveal(Some(&value)), "hunter2");
        assert_eq!(RenderMode::Redacted.reveal(Some(&value)), "xxxxxxxx");
        assert_eq!(RenderMode::WithSecrets.reveal(None), "");
        assert_eq!(RenderMode::Redacted.reveal(None), "xxxxxxxx");
    }

    #[test]
    fn test_interpolation_replaces_every_occurrence() {
        let fields = fields(&[("a", "1"), ("b", "2")]);
        let rendered = interpolate_secure_fields(
            "${__qs.a}-${__qs.b}-${__qs.a}",
            &fields,
            RenderMode::WithSecrets,
        );
        assert_eq!(rendered, "1-2-1");
    }

    #[test]
    fn test_interpolation_does_not_expand_substituted_values() {
        let nested = fields(&[("a", "${__qs.b}"), ("b", "2")]);
        let rendered =
            interpolate_secure_fields("${__qs.a}/${__qs.b}", &nested, RenderMode::WithSecrets);
        assert_eq!(rendered, "${__qs.b}/2");

        let later_key = fields(&[("a", "1"), ("z", "${__qs.a}")]);
        let rendered = interpolate_secure_fields("${__qs.z}", &later_key, RenderMode::WithSecrets);
        assert_eq!(rendered, "${__qs.a}");
    }

    #[test]
    fn test_interpolation_handles_unterminated_reference() {
        let fields = fields(&[("a", "1")]);
        let rendered =
            interpolate_secure_fields("${__qs.a}${__qs.a", &fields, RenderMode::WithSecrets);
        assert_eq!(rendered, "1${__qs.a");
    }

    #[test]
    fn test_interpolation_leaves_unknown_references() {
        let fields = fields(&[("a", "1")]);
        let rendered =
            interpolate_secure_fields("${__qs.missing}", &fields, RenderMode::WithSecrets);
        assert_eq!(rendered, "${__qs.missing}");
    }

    proptest! {
        #[test]
        fn redacted_interpolation_never_reveals_secret(
            secret_value in "[a-zA-Z0-9x]{1,24}",
            prefix in "[a-z/:.]{0,12}",
        ) {
            let fields = fields(&[("token", &secret_value)]);
            let input = format!("{prefix}${{__qs.token}}");

            let first = interpolate_secure_fields(&input, &fields, RenderMode::Redacted);
            let second = interpolate_secure_fields(&input, &fields, RenderMode::Redacted);

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first, format!("{prefix}{REDACTED_PLACEHOLDER}"));
        }
    }
}
