//! Routing of the base transport through the authenticated SOCKS relay.

use egress_common::{ConnectionSettings, SecureTunnelSettings, expose_or_empty};
use url::Url;

use crate::auth::{DecoratorKind, TransportStack};
use crate::error::ClientError;
use crate::transport::ProxyRoute;

/// Points the base transport of `stack` at the secure tunnel when enabled.
///
/// Signed AWS requests never go through the tunnel.
///
/// # Errors
///
/// Returns [`ClientError::SecureTunnel`] if the tunnel is enabled but its
/// address or credentials cannot form a proxy URL.
pub fn apply_secure_tunnel(
    stack: &mut TransportStack,
    settings: &ConnectionSettings,
) -> Result<(), ClientError> {
    if settings.is_aws_auth_configured() || stack.contains(DecoratorKind::AwsSigV4) {
        tracing::debug!("aws signing configured, not using the secure tunnel");
        return Ok(());
    }
    if !settings.secure_tunnel.enabled {
        return Ok(());
    }

    let url = tunnel_url(&settings.secure_tunnel).inspect_err(|e| {
        tracing::error!(error = %e, "error configuring secure socks proxy");
    })?;
    tracing::debug!(address = %settings.secure_tunnel.address, "routing through secure socks proxy");
    stack
        .innermost_mut()
        .set_proxy(ProxyRoute::SecureTunnel(url));
    Ok(())
}

fn tunnel_url(tunnel: &SecureTunnelSettings) -> Result<Url, ClientError> {
    let address = tunnel.address.trim();
    if address.is_empty() {
        return Err(ClientError::SecureTunnel("proxy address is empty".to_string()));
    }

    let mut url = Url::parse(&format!("socks5h://{address}"))
        .map_err(|e| ClientError::SecureTunnel(format!("invalid proxy address '{address}': {e}")))?;
    if url.host_str().is_none_or(str::is_empty) || url.port().is_none() || url.path() != "" {
        return Err(ClientError::SecureTunnel(format!(
            "proxy address '{address}' must be host:port"
        )));
    }

    if !tunnel.username.is_empty() {
        url.set_username(&tunnel.username)
            .map_err(|()| ClientError::SecureTunnel("invalid proxy username".to_string()))?;
        url.set_password(Some(expose_or_empty(tunnel.password.as_ref())))
            .map_err(|()| ClientError::SecureTunnel("invalid proxy password".to_string()))?;
    }
    Ok(url)
}
