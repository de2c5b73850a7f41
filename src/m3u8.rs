//! M3U8 playlist resolution
//!
//! Fetches a playlist URL and recursively resolves it into a flat list of
//! segment URLs. Master playlists are followed by selecting the variant
//! with the highest `BANDWIDTH`; `#EXT-X-KEY` lines yield the AES-128 key
//! bytes and IV used to decrypt segments at merge time.

use crate::error::{DownloadError, ProtocolErrorKind, Result};

use reqwest::Client;
use url::Url;

/// Maximum master-playlist indirections to follow.
const MAX_PLAYLIST_DEPTH: usize = 5;

/// AES-128-CBC key material extracted from `#EXT-X-KEY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsKey {
    /// Raw key bytes fetched from the key URI (16 bytes for AES-128)
    pub key: Vec<u8>,
    /// Initialization vector; 16 zero bytes when the playlist omits `IV=`
    pub iv: [u8; 16],
}

/// A fully resolved media playlist.
#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    /// Absolute segment URLs in playlist order
    pub segments: Vec<String>,
    /// Decryption key, if the playlist is encrypted
    pub key: Option<HlsKey>,
}

/// One variant line of a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Variant {
    bandwidth: u64,
    url: String,
}

/// Resolves playlists into segment lists.
pub struct M3u8Parser<'a> {
    client: &'a Client,
    headers: &'a [(String, String)],
}

impl<'a> M3u8Parser<'a> {
    pub fn new(client: &'a Client, headers: &'a [(String, String)]) -> Self {
        Self { client, headers }
    }

    /// Fetch and resolve `m3u8_url` into a flat media playlist.
    pub async fn resolve(&self, m3u8_url: &str) -> Result<MediaPlaylist> {
        let original_url = m3u8_url.to_string();
        // Base for relative resolution; replaced at each master indirection.
        let mut redirect_url = original_url.clone();

        for _ in 0..MAX_PLAYLIST_DEPTH {
            let body = self.fetch_text(&redirect_url).await?;

            if let Some(variants) = parse_master(&body) {
                let best = variants
                    .into_iter()
                    .max_by_key(|v| v.bandwidth)
                    .ok_or_else(|| {
                        DownloadError::protocol(
                            ProtocolErrorKind::InvalidPlaylist,
                            "master playlist has no variants",
                        )
                    })?;
                redirect_url = resolve_url(&redirect_url, &best.url)?;
                tracing::debug!(bandwidth = best.bandwidth, url = %redirect_url, "selected variant");
                continue;
            }

            return self.parse_media(&redirect_url, &body).await;
        }

        Err(DownloadError::protocol(
            ProtocolErrorKind::InvalidPlaylist,
            format!("playlist nesting exceeds {} levels", MAX_PLAYLIST_DEPTH),
        ))
    }

    async fn parse_media(&self, base_url: &str, body: &str) -> Result<MediaPlaylist> {
        let mut segments = Vec::new();
        let mut key = None;

        for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(attrs) = line.strip_prefix("#EXT-X-KEY:") {
                if let Some(uri) = attr_value(attrs, "URI") {
                    let key_url = resolve_url(base_url, &uri)?;
                    let key_bytes = self.fetch_bytes(&key_url).await?;
                    let iv = attr_iv(attrs)?;
                    key = Some(HlsKey { key: key_bytes, iv });
                }
            } else if !line.starts_with('#') {
                segments.push(resolve_url(base_url, line)?);
            }
        }

        if segments.is_empty() {
            return Err(DownloadError::protocol(
                ProtocolErrorKind::InvalidPlaylist,
                "media playlist contains no segments",
            ));
        }

        Ok(MediaPlaylist { segments, key })
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        Ok(self.request(url).await?.text().await?)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        Ok(self.request(url).await?.bytes().await?.to_vec())
    }

    async fn request(&self, url: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        for (name, value) in self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::network(
                crate::error::NetworkErrorKind::HttpStatus(status.as_u16()),
                format!("GET {} returned {}", url, status),
            ));
        }
        Ok(response)
    }
}

/// Parse master-playlist variants; `None` when the body is a media playlist.
fn parse_master(body: &str) -> Option<Vec<Variant>> {
    let mut variants = Vec::new();
    let mut pending_bandwidth: Option<u64> = None;

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending_bandwidth = attr_value(attrs, "BANDWIDTH").and_then(|v| v.parse().ok());
        } else if !line.starts_with('#') {
            if let Some(bandwidth) = pending_bandwidth.take() {
                variants.push(Variant {
                    bandwidth,
                    url: line.to_string(),
                });
            }
        }
    }

    if variants.is_empty() {
        None
    } else {
        Some(variants)
    }
}

/// Extract one attribute value from an attribute list, handling quoting.
fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let needle = format!("{}=", name);
    let start = attrs.find(&needle)? + needle.len();
    let rest = &attrs[start..];
    if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted.find('"')?;
        Some(quoted[..end].to_string())
    } else {
        let end = rest.find(',').unwrap_or(rest.len());
        Some(rest[..end].to_string())
    }
}

/// Parse `IV=0x...` into 16 bytes; defaults to all zeros when absent.
fn attr_iv(attrs: &str) -> Result<[u8; 16]> {
    let mut iv = [0u8; 16];
    if let Some(raw) = attr_value(attrs, "IV") {
        let hex_str = raw.trim_start_matches("0x").trim_start_matches("0X");
        let bytes = hex::decode(hex_str).map_err(|e| {
            DownloadError::protocol(
                ProtocolErrorKind::InvalidPlaylist,
                format!("invalid IV attribute: {}", e),
            )
        })?;
        if bytes.len() != 16 {
            return Err(DownloadError::protocol(
                ProtocolErrorKind::InvalidPlaylist,
                format!("IV must be 16 bytes, got {}", bytes.len()),
            ));
        }
        iv.copy_from_slice(&bytes);
    }
    Ok(iv)
}

/// Resolve a playlist line against its base URL.
///
/// Absolute URLs pass through; root-relative paths resolve against the
/// stream's scheme+host; anything else resolves against the last
/// `/`-terminated prefix of the base.
pub fn resolve_url(base: &str, line: &str) -> Result<String> {
    if line.contains("http") {
        return Ok(line.to_string());
    }
    if line.starts_with('/') {
        let parsed = Url::parse(base)?;
        let host = parsed.host_str().ok_or_else(|| {
            DownloadError::protocol(
                ProtocolErrorKind::InvalidUrl,
                format!("base URL has no host: {}", base),
            )
        })?;
        let port = parsed
            .port()
            .map(|p| format!(":{}", p))
            .unwrap_or_default();
        return Ok(format!("{}://{}{}{}", parsed.scheme(), host, port, line));
    }
    match base.rfind('/') {
        Some(idx) => Ok(format!("{}{}", &base[..=idx], line)),
        None => Ok(line.to_string()),
    }
}
