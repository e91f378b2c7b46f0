//! Info-hash extraction from magnet links and `.torrent` metainfo.

use sha1::{Digest, Sha1};

use crate::error::{ClientError, Result};

const MAX_DEPTH: usize = 64;

/// Extract the BitTorrent v1 info-hash from a magnet URI as lowercase hex.
///
/// Accepts both the 40-character hex and the 32-character base32 forms.
pub fn magnet_info_hash(magnet: &str) -> Option<String> {
    let query = magnet.strip_prefix("magnet:")?.trim_start_matches('?');

    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key.starts_with("xt"))
        .find_map(|(_, value)| {
            let value = value.to_ascii_lowercase();
            let hash = value.strip_prefix("urn:btih:")?;
            normalize_info_hash(hash)
        })
}

/// Display name (`dn`) of a magnet URI.
pub fn magnet_display_name(magnet: &str) -> Option<String> {
    let query = magnet.strip_prefix("magnet:")?.trim_start_matches('?');
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "dn")
        .map(|(_, value)| value.into_owned())
}

/// Normalize a hex or base32 info-hash into lowercase hex.
pub fn normalize_info_hash(hash: &str) -> Option<String> {
    match hash.len() {
        40 if is_info_hash(hash) => Some(hash.to_ascii_lowercase()),
        32 => base32_decode(hash).map(hex::encode),
        _ => None,
    }
}

/// True for a 40-character hexadecimal string.
pub fn is_info_hash(value: &str) -> bool {
    value.len() == 40 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits = 0u32;

    for c in input.bytes() {
        let value = match c.to_ascii_uppercase() {
            c @ b'A'..=b'Z' => c - b'A',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | u64::from(value);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    (out.len() == 20).then_some(out)
}

/// Compute the info-hash of a `.torrent` file: SHA-1 over the raw bencoded
/// `info` dictionary exactly as it appears in the payload.
pub fn torrent_info_hash(data: &[u8]) -> Result<String> {
    let span = info_span(data)?;
    let digest = Sha1::digest(&data[span.0..span.1]);
    Ok(hex::encode(digest))
}

fn invalid(message: &str) -> ClientError {
    ClientError::InvalidSource(format!("invalid torrent file: {message}"))
}

fn info_span(data: &[u8]) -> Result<(usize, usize)> {
    if data.first() != Some(&b'd') {
        return Err(invalid("metainfo is not a dictionary"));
    }

    let mut pos = 1;
    while pos < data.len() && data[pos] != b'e' {
        let (key, after_key) = read_string(data, pos)?;
        let end = skip_value(data, after_key, 0)?;
        if key == b"info" {
            if data.get(after_key) != Some(&b'd') {
                return Err(invalid("info is not a dictionary"));
            }
            return Ok((after_key, end));
        }
        pos = end;
    }

    Err(invalid("missing info dictionary"))
}

fn read_string(data: &[u8], pos: usize) -> Result<(&[u8], usize)> {
    let colon = data[pos..]
        .iter()
        .position(|&b| b == b':')
        .map(|offset| pos + offset)
        .ok_or_else(|| invalid("unterminated string length"))?;

    let len: usize = std::str::from_utf8(&data[pos..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid("bad string length"))?;

    let start = colon + 1;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| invalid("string exceeds payload"))?;

    Ok((&data[start..end], end))
}

fn skip_value(data: &[u8], pos: usize, depth: usize) -> Result<usize> {
    if depth > MAX_DEPTH {
        return Err(invalid("nesting too deep"));
    }

    match data.get(pos) {
        Some(b'i') => data[pos..]
            .iter()
            .position(|&b| b == b'e')
            .map(|offset| pos + offset + 1)
            .ok_or_else(|| invalid("unterminated integer")),
        Some(b'l') => {
            let mut cursor = pos + 1;
            while data.get(cursor) != Some(&b'e') {
                if cursor >= data.len() {
                    return Err(invalid("unterminated list"));
                }
                cursor = skip_value(data, cursor, depth + 1)?;
            }
            Ok(cursor + 1)
        }
        Some(b'd') => {
            let mut cursor = pos + 1;
            while data.get(cursor) != Some(&b'e') {
                if cursor >= data.len() {
                    return Err(invalid("unterminated dictionary"));
                }
                let (_, after_key) = read_string(data, cursor)?;
                cursor = skip_value(data, after_key, depth + 1)?;
            }
            Ok(cursor + 1)
        }
        Some(b'0'..=b'9') => read_string(data, pos).map(|(_, end)| end),
        Some(_) => Err(invalid("unexpected token")),
        None => Err(invalid("unexpected end of payload")),
    }
}
