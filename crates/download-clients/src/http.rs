//! HTTP client construction shared by the adapters.

use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

use crate::error::{ClientError, Result};

/// Timeout applied to every daemon request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = concat!("bookfetch/", env!("CARGO_PKG_VERSION"));

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Client used for daemon RPC calls.
pub fn build_client(disable_ssl_verify: bool) -> Result<reqwest::Client> {
    install_rustls_provider();
    builder(disable_ssl_verify)
        .build()
        .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))
}

/// Client used for fetching source payloads.
///
/// Redirects are not followed automatically so a `magnet:` `Location`
/// header can be captured.
pub fn build_fetch_client(disable_ssl_verify: bool) -> Result<reqwest::Client> {
    install_rustls_provider();
    builder(disable_ssl_verify)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))
}

fn builder(disable_ssl_verify: bool) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .danger_accept_invalid_certs(disable_ssl_verify)
}
