//! Stored (flat, camelCase) client configuration and its validation.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ClientError, Result};
use crate::models::{ClientAuth, ClientConnection, ClientKind, DownloadClientConfig};
use crate::path_mapping::PathMapping;

/// Category used when a client does not configure one.
pub const DEFAULT_CATEGORY: &str = "readmeabook";

fn default_true() -> bool {
    true
}

/// One entry of the `download_clients` settings array, exactly as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredClientConfig {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub client_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, rename = "disableSSLVerify")]
    pub disable_ssl_verify: bool,
    #[serde(default)]
    pub remote_path_mapping_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_path: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl StoredClientConfig {
    /// Validate into the typed configuration adapters are built from.
    pub fn validate(&self) -> Result<DownloadClientConfig> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ClientError::Config("client id must not be empty".to_string()));
        }

        let kind = ClientKind::from_str(&self.client_type.trim().to_ascii_lowercase())
            .map_err(|_| {
                ClientError::Config(format!(
                    "client {id}: unsupported type '{}'",
                    self.client_type
                ))
            })?;

        let url = self.url.trim().trim_end_matches('/');
        if url.is_empty() {
            return Err(ClientError::Config(format!("client {id}: URL must not be empty")));
        }
        let parsed = Url::parse(url)
            .map_err(|e| ClientError::Config(format!("client {id}: invalid URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::Config(format!(
                "client {id}: URL must use http or https"
            )));
        }

        let username = non_empty(&self.username);
        let password = self.password.clone().filter(|p| !p.is_empty());

        let auth = match kind {
            ClientKind::Qbittorrent => ClientAuth::Credentials {
                username: username.unwrap_or_default(),
                password: password.unwrap_or_default(),
            },
            ClientKind::Transmission => ClientAuth::OptionalBasic { username, password },
            ClientKind::Deluge => ClientAuth::Password(password.unwrap_or_default()),
            ClientKind::Sabnzbd => ClientAuth::ApiKey(password.ok_or_else(|| {
                ClientError::Config(format!("client {id}: SABnzbd requires an API key"))
            })?),
            ClientKind::Nzbget => ClientAuth::Credentials {
                username: username.unwrap_or_default(),
                password: password.ok_or_else(|| {
                    ClientError::Config(format!("client {id}: NZBGet requires a password"))
                })?,
            },
        };

        let path_mapping = if self.remote_path_mapping_enabled {
            match (non_empty(&self.remote_path), non_empty(&self.local_path)) {
                (Some(remote), Some(local)) => Some(PathMapping::new(remote, local)),
                _ => {
                    return Err(ClientError::Config(format!(
                        "client {id}: path mapping enabled without both remote and local paths"
                    )));
                }
            }
        } else {
            None
        };

        let name = match self.name.trim() {
            "" => kind.display_name().to_string(),
            name => name.to_string(),
        };

        Ok(DownloadClientConfig {
            id: id.to_string(),
            name,
            kind,
            enabled: self.enabled,
            connection: ClientConnection {
                url: url.to_string(),
                auth,
                disable_ssl_verify: self.disable_ssl_verify,
            },
            path_mapping,
            category: non_empty(&self.category).unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            custom_path: non_empty(&self.custom_path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;

    fn parse(json: &str) -> StoredClientConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_validate_full_entry() {
        let stored = parse(
            r#"{
                "id": "c1",
                "type": "qbittorrent",
                "name": "Seedbox",
                "enabled": true,
                "url": "https://qb.example.com/",
                "username": "admin",
                "password": "pw",
                "disableSSLVerify": true,
                "remotePathMappingEnabled": true,
                "remotePath": "/data",
                "localPath": "/mnt/data",
                "category": "books",
                "customPath": "audiobooks"
            }"#,
        );
        let config = stored.validate().unwrap();
        assert_eq!(config.kind, ClientKind::Qbittorrent);
        assert_eq!(config.protocol(), Protocol::Torrent);
        assert_eq!(config.connection.url, "https://qb.example.com");
        assert!(config.connection.disable_ssl_verify);
        assert_eq!(config.path_mapping, Some(PathMapping::new("/data", "/mnt/data")));
        assert_eq!(config.category, "books");
        assert_eq!(config.custom_path.as_deref(), Some("audiobooks"));
    }

    #[test]
    fn test_defaults() {
        let config = parse(r#"{"id":"t","type":"Transmission","url":"http://tr:9091"}"#)
            .validate()
            .unwrap();
        assert!(config.enabled);
        assert_eq!(config.name, "Transmission");
        assert_eq!(config.category, DEFAULT_CATEGORY);
        assert_eq!(
            config.connection.auth,
            ClientAuth::OptionalBasic {
                username: None,
                password: None
            }
        );
    }

    #[test]
    fn test_rejections() {
        assert!(parse(r#"{"id":"","type":"deluge","url":"http://d"}"#).validate().is_err());
        assert!(parse(r#"{"id":"a","type":"deluge","url":""}"#).validate().is_err());
        assert!(parse(r#"{"id":"a","type":"rtorrent","url":"http://r"}"#).validate().is_err());
        assert!(parse(r#"{"id":"a","type":"sabnzbd","url":"http://s"}"#).validate().is_err());
        assert!(
            parse(r#"{"id":"a","type":"sabnzbd","url":"ftp://s","password":"k"}"#)
                .validate()
                .is_err()
        );
        assert!(
            parse(r#"{"id":"a","type":"qbittorrent","url":"http://q","remotePathMappingEnabled":true,"remotePath":"/x"}"#)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_round_trips_camel_case_keys() {
        let stored = parse(r#"{"id":"n","type":"nzbget","url":"http://n:6789","password":"p"}"#);
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["type"], "nzbget");
        assert_eq!(json["disableSSLVerify"], false);
        assert_eq!(json["remotePathMappingEnabled"], false);
    }
}
