//! Azure blob storage account target.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use egress_common::{AzureBlobSettings, expose_or_empty};
use url::Url;

use crate::error::ClientError;

/// Account URL used when the settings leave it empty; `%s` is the account name.
pub const DEFAULT_ACCOUNT_URL: &str = "https://%s.blob.core.windows.net/";

/// A storage account with its decoded shared key.
#[derive(Clone)]
pub struct BlobStorageTarget {
    account_url: Url,
    account_name: String,
    account_key: Vec<u8>,
}

impl fmt::Debug for BlobStorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStorageTarget")
            .field("account_url", &self.account_url.as_str())
            .field("account_name", &self.account_name)
            .field("account_key", &"[REDACTED]")
            .finish()
    }
}

impl BlobStorageTarget {
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidBlobCredentials`] if the account name is
    /// empty, the key is not base64, or the account URL is invalid.
    pub fn from_settings(settings: &AzureBlobSettings) -> Result<Self, ClientError> {
        if settings.account_name.is_empty() {
            return Err(ClientError::InvalidBlobCredentials(
                "account name is empty".to_string(),
            ));
        }
        let account_key = STANDARD
            .decode(expose_or_empty(settings.account_key.as_ref()))
            .map_err(|e| ClientError::InvalidBlobCredentials(format!("invalid account key: {e}")))?;

        let template = if settings.account_url.is_empty() {
            DEFAULT_ACCOUNT_URL
        } else {
            settings.account_url.as_str()
        };
        let raw = template.replace("%s", &settings.account_name);
        let account_url = Url::parse(&raw).map_err(|e| {
            ClientError::InvalidBlobCredentials(format!("invalid account url '{raw}': {e}"))
        })?;

        Ok(Self {
            account_url,
            account_name: settings.account_name.clone(),
            account_key,
        })
    }

    #[must_use]
    pub const fn account_url(&self) -> &Url {
        &self.account_url
    }

    #[must_use]
    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    #[must_use]
    pub fn account_key(&self) -> &[u8] {
        &self.account_key
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use egress_common::secret;

    use super::*;

    fn settings(url: &str, key: &str) -> AzureBlobSettings {
        AzureBlobSettings {
            account_url: url.to_string(),
            account_name: "acct".to_string(),
            account_key: Some(secret(key)),
        }
    }

    #[test]
    fn test_default_account_url() {
        let target = BlobStorageTarget::from_settings(&settings("", "c2VjcmV0")).unwrap();
        assert_eq!(target.account_url().as_str(), "https://acct.blob.core.windows.net/");
        assert_eq!(target.account_key(), b"secret");
        assert!(!format!("{target:?}").contains("secret"));
    }

    #[test]
    fn test_custom_account_url() {
        let target =
            BlobStorageTarget::from_settings(&settings("http://127.0.0.1:10000/%s/", "c2VjcmV0")).unwrap();
        assert_eq!(target.account_url().as_str(), "http://127.0.0.1:10000/acct/");

        let target =
            BlobStorageTarget::from_settings(&settings("https://blob.internal/", "c2VjcmV0")).unwrap();
        assert_eq!(target.account_url().as_str(), "https://blob.internal/");
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let err = BlobStorageTarget::from_settings(&settings("", "not base64!")).unwrap_err();
        assert!(matches!(err, ClientError::InvalidBlobCredentials(_)));
        assert!(err.to_string().starts_with("invalid azure blob credentials"));
    }
}
