//! Error taxonomy shared by every download-client adapter.

use std::error::Error as StdError;

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised while talking to a download daemon.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Credentials were rejected (HTTP 401/403 or a daemon-specific login failure).
    #[error("{client} authentication failed: {message}")]
    Auth {
        client: &'static str,
        message: String,
    },

    /// The TCP connection was actively refused.
    #[error("Connection refused by {client} at {url}")]
    ConnectionRefused { client: &'static str, url: String },

    /// The host name could not be resolved or the host is unreachable.
    #[error("Could not reach {client} at {url}: {message}")]
    Unreachable {
        client: &'static str,
        url: String,
        message: String,
    },

    /// The request did not complete in time.
    #[error("Request to {client} at {url} timed out")]
    Timeout { client: &'static str, url: String },

    /// TLS handshake or certificate validation failed.
    #[error("TLS error talking to {client} at {url}: {message}")]
    Tls {
        client: &'static str,
        url: String,
        message: String,
    },

    /// The daemon answered the RPC call with an error object.
    #[error("{client} RPC error in {method}: {message}")]
    Rpc {
        client: &'static str,
        method: String,
        message: String,
    },

    /// The daemon refused the submitted payload.
    #[error("{client} rejected the download: {message}")]
    Rejected {
        client: &'static str,
        message: String,
    },

    /// The source URL or downloaded payload is unusable.
    #[error("Invalid download source: {0}")]
    InvalidSource(String),

    /// The daemon answered with an unexpected HTTP status.
    #[error("{client} returned HTTP {status}: {body}")]
    Http {
        client: &'static str,
        status: u16,
        body: String,
    },

    /// The daemon answered with a body we could not interpret.
    #[error("Malformed response from {client}: {message}")]
    Decode {
        client: &'static str,
        message: String,
    },

    /// The client configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Any other transport failure.
    #[error("Request to {client} failed: {source}")]
    Request {
        client: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl ClientError {
    /// Classify a transport-level `reqwest` failure.
    ///
    /// The distinction matters because every class maps to a different
    /// actionable message in [`ClientError::user_message`].
    pub fn from_reqwest(client: &'static str, url: &str, err: reqwest::Error) -> Self {
        let url = url.to_string();
        let chain = error_chain_text(&err);

        if err.is_timeout() {
            return Self::Timeout { client, url };
        }

        if let Some(status) = err.status()
            && matches!(status.as_u16(), 401 | 403)
        {
            return Self::Auth {
                client,
                message: format!("HTTP {}", status.as_u16()),
            };
        }

        if has_io_kind(&err, std::io::ErrorKind::ConnectionRefused)
            || chain.contains("connection refused")
        {
            return Self::ConnectionRefused { client, url };
        }

        if chain.contains("certificate")
            || chain.contains("tls")
            || chain.contains("ssl")
            || chain.contains("handshake")
        {
            return Self::Tls {
                client,
                url,
                message: chain,
            };
        }

        if chain.contains("dns error")
            || chain.contains("failed to lookup address")
            || chain.contains("name or service not known")
            || chain.contains("no such host")
        {
            return Self::Unreachable {
                client,
                url,
                message: chain,
            };
        }

        if err.is_connect() {
            return Self::Unreachable {
                client,
                url,
                message: chain,
            };
        }

        Self::Request { client, source: err }
    }

    /// Map an HTTP status that is not a success into the taxonomy.
    pub fn from_status(client: &'static str, status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Auth {
                client,
                message: if body.is_empty() {
                    format!("HTTP {status}")
                } else {
                    format!("HTTP {status}: {body}")
                },
            },
            _ => Self::Http {
                client,
                status,
                body,
            },
        }
    }

    pub fn decode(client: &'static str, message: impl Into<String>) -> Self {
        Self::Decode {
            client,
            message: message.into(),
        }
    }

    pub fn rpc(client: &'static str, method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            client,
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn rejected(client: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            client,
            message: message.into(),
        }
    }

    /// True for credential problems.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// True for failures that may succeed when retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. }
                | Self::Unreachable { .. }
                | Self::Timeout { .. }
                | Self::Request { .. }
        ) || matches!(self, Self::Http { status, .. } if *status >= 500)
    }

    /// Actionable, user-facing description of the failure.
    pub fn user_message(&self) -> String {
        match self {
            Self::Auth { client, .. } => format!(
                "Authentication failed. Check the username and password configured for {client}."
            ),
            Self::ConnectionRefused { client, url } => format!(
                "Connection refused at {url}. Verify that {client} is running and that the host and port are correct."
            ),
            Self::Unreachable { client, url, .. } => format!(
                "Could not reach {client} at {url}. Check the hostname and that the server is reachable from this machine."
            ),
            Self::Timeout { client, url } => format!(
                "Connection to {client} at {url} timed out. Check the URL and network connectivity."
            ),
            Self::Tls { client, .. } => format!(
                "SSL/TLS certificate error while connecting to {client}. If it uses a self-signed certificate, enable 'Disable SSL verification' for this client."
            ),
            other => other.to_string(),
        }
    }
}

fn error_chain_text(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text.to_lowercase()
}

fn has_io_kind(err: &(dyn StdError + 'static), kind: std::io::ErrorKind) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>()
            && io.kind() == kind
        {
            return true;
        }
        source = inner.source();
    }
    false
}
