//! Fetching and classifying download sources.
//!
//! Indexers hand out three kinds of links: plain magnet URIs, HTTP URLs
//! serving a `.torrent`/`.nzb` payload, and HTTP URLs that redirect to a
//! magnet URI. The helpers here resolve all of them before an adapter talks
//! to its daemon.

use std::io::Read;

use flate2::read::GzDecoder;
use reqwest::header::{CONTENT_DISPOSITION, LOCATION};
use tracing::debug;
use url::Url;

use crate::error::{ClientError, Result};
use crate::http::build_fetch_client;
use crate::torrent::{magnet_display_name, magnet_info_hash, torrent_info_hash};

const MAX_REDIRECTS: usize = 10;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A torrent source resolved to its content identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentSource {
    Magnet {
        uri: String,
        info_hash: String,
    },
    File {
        data: Vec<u8>,
        info_hash: String,
        filename: String,
    },
}

impl TorrentSource {
    pub fn info_hash(&self) -> &str {
        match self {
            Self::Magnet { info_hash, .. } | Self::File { info_hash, .. } => info_hash,
        }
    }

    /// Parse a magnet URI without any network access.
    pub fn from_magnet(uri: &str) -> Result<Self> {
        let info_hash = magnet_info_hash(uri).ok_or_else(|| {
            ClientError::InvalidSource("magnet link has no BitTorrent info-hash".to_string())
        })?;
        Ok(Self::Magnet {
            uri: uri.to_string(),
            info_hash,
        })
    }

    pub fn display_name(&self) -> Option<String> {
        match self {
            Self::Magnet { uri, .. } => magnet_display_name(uri),
            Self::File { filename, .. } => Some(filename.clone()),
        }
    }
}

/// A downloaded, decompressed NZB document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NzbPayload {
    /// Name without `.nzb`/`.gz` extension.
    pub name: String,
    pub data: Vec<u8>,
}

impl NzbPayload {
    pub fn filename(&self) -> String {
        format!("{}.nzb", self.name)
    }
}

enum Fetched {
    Magnet(String),
    Body {
        data: Vec<u8>,
        url: Url,
        disposition: Option<String>,
    },
}

/// Downloads source payloads on behalf of an adapter.
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
    client_name: &'static str,
}

impl SourceFetcher {
    pub fn new(client_name: &'static str, disable_ssl_verify: bool) -> Result<Self> {
        Ok(Self {
            client: build_fetch_client(disable_ssl_verify)?,
            client_name,
        })
    }

    /// Resolve a magnet URI or torrent URL into a [`TorrentSource`].
    pub async fn resolve_torrent(&self, source_url: &str) -> Result<TorrentSource> {
        let source_url = require_url(source_url)?;
        if source_url.starts_with("magnet:") {
            return TorrentSource::from_magnet(source_url);
        }

        match self.fetch(source_url).await? {
            Fetched::Magnet(uri) => {
                debug!(url = %source_url, "Source redirected to magnet link");
                TorrentSource::from_magnet(&uri)
            }
            Fetched::Body {
                data,
                url,
                disposition,
            } => {
                // Some indexers answer 200 with the magnet URI as the body.
                if data.starts_with(b"magnet:") {
                    let uri = String::from_utf8_lossy(&data).trim().to_string();
                    return TorrentSource::from_magnet(&uri);
                }
                let info_hash = torrent_info_hash(&data)?;
                let filename = disposition
                    .as_deref()
                    .and_then(filename_from_disposition)
                    .or_else(|| last_path_segment(&url))
                    .unwrap_or_else(|| format!("{info_hash}.torrent"));
                Ok(TorrentSource::File {
                    data,
                    info_hash,
                    filename,
                })
            }
        }
    }

    /// Download an NZB, transparently decompressing gzip payloads.
    pub async fn fetch_nzb(&self, source_url: &str) -> Result<NzbPayload> {
        let source_url = require_url(source_url)?;
        if source_url.starts_with("magnet:") {
            return Err(ClientError::InvalidSource(
                "magnet links cannot be sent to a usenet client".to_string(),
            ));
        }

        match self.fetch(source_url).await? {
            Fetched::Magnet(_) => Err(ClientError::InvalidSource(format!(
                "{source_url} redirected to a magnet link, expected an NZB"
            ))),
            Fetched::Body {
                data,
                url,
                disposition,
            } => {
                let data = decompress_if_gzip(data)?;
                if data.is_empty() {
                    return Err(ClientError::InvalidSource(format!(
                        "NZB downloaded from {source_url} is empty after decompression"
                    )));
                }
                let name = nzb_name(disposition.as_deref(), &url);
                Ok(NzbPayload { name, data })
            }
        }
    }

    async fn fetch(&self, source_url: &str) -> Result<Fetched> {
        let mut current = Url::parse(source_url)
            .map_err(|e| ClientError::InvalidSource(format!("invalid URL {source_url}: {e}")))?;

        for _ in 0..=MAX_REDIRECTS {
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| ClientError::from_reqwest(self.client_name, current.as_str(), e))?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        ClientError::InvalidSource(format!(
                            "redirect from {current} has no Location header"
                        ))
                    })?;

                if location.starts_with("magnet:") {
                    return Ok(Fetched::Magnet(location.to_string()));
                }

                current = current.join(location).map_err(|e| {
                    ClientError::InvalidSource(format!("invalid redirect target {location}: {e}"))
                })?;
                continue;
            }

            if !status.is_success() {
                return Err(ClientError::InvalidSource(format!(
                    "failed to download {source_url}: HTTP {}",
                    status.as_u16()
                )));
            }

            let disposition = response
                .headers()
                .get(CONTENT_DISPOSITION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            let data = response
                .bytes()
                .await
                .map_err(|e| ClientError::from_reqwest(self.client_name, current.as_str(), e))?;

            if data.is_empty() {
                return Err(ClientError::InvalidSource(format!(
                    "file downloaded from {source_url} is empty"
                )));
            }

            return Ok(Fetched::Body {
                data: data.to_vec(),
                url: current,
                disposition,
            });
        }

        Err(ClientError::InvalidSource(format!(
            "too many redirects while downloading {source_url}"
        )))
    }
}

fn require_url(source_url: &str) -> Result<&str> {
    let trimmed = source_url.trim();
    if trimmed.is_empty() {
        return Err(ClientError::InvalidSource(
            "download URL is empty".to_string(),
        ));
    }
    Ok(trimmed)
}

/// Decompress a payload that starts with the gzip magic bytes.
pub fn decompress_if_gzip(data: Vec<u8>) -> Result<Vec<u8>> {
    if !data.starts_with(&GZIP_MAGIC) {
        return Ok(data);
    }

    let mut decoded = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data.as_slice())
        .read_to_end(&mut decoded)
        .map_err(|e| ClientError::InvalidSource(format!("corrupt gzip payload: {e}")))?;
    Ok(decoded)
}

/// Extract `filename` from a `Content-Disposition` header value.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    for part in header.split(';').map(str::trim) {
        if let Some(value) = part.strip_prefix("filename*=") {
            // RFC 5987: charset'lang'percent-encoded
            let encoded = value.rsplit('\'').next().unwrap_or(value);
            if let Ok(decoded) = urlencoding::decode(encoded.trim_matches('"')) {
                let decoded = decoded.trim().to_string();
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
        } else if let Some(value) = part.strip_prefix("filename=") {
            let value = value.trim().trim_matches('"').trim();
            if !value.is_empty() {
                plain = Some(value.to_string());
            }
        }
    }
    plain
}

fn last_path_segment(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.rev().find(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(segment).ok()?;
    Some(decoded.into_owned())
}

/// Strip `.gz` and `.nzb` extensions (case-insensitive).
pub fn strip_nzb_extensions(name: &str) -> String {
    let mut name = name.trim();
    for ext in [".gz", ".nzb"] {
        let cut = name.len().saturating_sub(ext.len());
        if cut > 0
            && name
                .get(cut..)
                .is_some_and(|tail| tail.eq_ignore_ascii_case(ext))
        {
            name = &name[..cut];
        }
    }
    name.to_string()
}

fn nzb_name(disposition: Option<&str>, url: &Url) -> String {
    disposition
        .and_then(filename_from_disposition)
        .or_else(|| last_path_segment(url))
        .map(|name| strip_nzb_extensions(&name))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

/// Compare NZB names ignoring case, `.`, `_` and spaces.
pub fn nzb_names_match(a: &str, b: &str) -> bool {
    let key = |s: &str| -> String {
        strip_nzb_extensions(s)
            .chars()
            .filter(|c| !matches!(c, '.' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect()
    };
    let (a, b) = (key(a), key(b));
    !a.is_empty() && a == b
}
