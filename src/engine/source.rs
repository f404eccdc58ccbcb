//! Image references accepted by the engine and the HTTP side of resolving them.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use url::Url;

use crate::engine::errors::{BackendError, MatchError};

const USER_AGENT_DEFAULT: &str = concat!("lookalike/", env!("CARGO_PKG_VERSION"));

/// Media types the feature extractor will hand to a model.
const SUPPORTED_MEDIA_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/gif",
    "image/bmp",
];

/// A validated image reference.
#[derive(Debug, Clone)]
pub enum ImageRef {
    /// Inline upload; `bytes` is the decoded payload.
    Data {
        media_type: String,
        bytes: Arc<[u8]>,
    },
    Remote(Url),
}

impl ImageRef {
    /// Accept data URIs (base64) and http/https URLs, nothing else.
    pub fn parse(raw: &str) -> Result<Self, MatchError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MatchError::InvalidImageReference(
                "empty image reference".to_string(),
            ));
        }

        if let Some(rest) = raw.strip_prefix("data:") {
            return parse_data_uri(rest);
        }

        if raw.starts_with("http://") || raw.starts_with("https://") {
            let url = Url::parse(raw)
                .map_err(|e| MatchError::InvalidImageReference(format!("{e}")))?;
            if url.host_str().map_or(true, str::is_empty) {
                return Err(MatchError::InvalidImageReference(
                    "URL has no host".to_string(),
                ));
            }
            return Ok(ImageRef::Remote(url));
        }

        Err(MatchError::InvalidImageReference(
            "unsupported reference format".to_string(),
        ))
    }

    /// Key under which the extracted vector is cached: the URL for remote
    /// images, a content hash for uploaded bytes.
    pub fn cache_key(&self) -> String {
        match self {
            ImageRef::Data { bytes, .. } => content_key(bytes),
            ImageRef::Remote(url) => url.to_string(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ImageRef::Remote(_))
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageRef::Data { media_type, bytes } => {
                write!(f, "data:{media_type} ({} bytes)", bytes.len())
            }
            ImageRef::Remote(url) => write!(f, "{url}"),
        }
    }
}

/// `sha256:<hex>` of the payload.
pub fn content_key(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{hex}")
}

fn parse_data_uri(rest: &str) -> Result<ImageRef, MatchError> {
    let (header, payload) = rest.split_once(',').ok_or_else(|| {
        MatchError::InvalidImageReference("data URI has no payload".to_string())
    })?;

    let Some(media_type) = header.strip_suffix(";base64") else {
        return Err(MatchError::InvalidImageReference(
            "data URI must be base64-encoded".to_string(),
        ));
    };

    let payload: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| MatchError::InvalidImageReference(format!("bad base64 payload: {e}")))?;

    if bytes.is_empty() {
        return Err(MatchError::InvalidImageReference(
            "data URI payload is empty".to_string(),
        ));
    }

    Ok(ImageRef::Data {
        media_type: media_type.to_string(),
        bytes: bytes.into(),
    })
}

/// Sniff the payload and reject anything the models cannot decode.
pub fn check_format(bytes: &[u8]) -> Result<&'static str, MatchError> {
    match infer::get(bytes) {
        Some(kind) if SUPPORTED_MEDIA_TYPES.contains(&kind.mime_type()) => Ok(kind.mime_type()),
        Some(kind) => Err(MatchError::ImageFormatUnsupported(
            kind.mime_type().to_string(),
        )),
        None => Err(MatchError::ImageFormatUnsupported(
            "unrecognized content".to_string(),
        )),
    }
}

/// Network access for remote images. Implementations are blocking and are
/// driven from the blocking thread pool.
pub trait ImageFetcher: Send + Sync {
    /// Cheap existence/content-type check.
    fn probe(&self, url: &Url) -> Result<(), BackendError>;

    fn fetch(&self, url: &Url) -> Result<Vec<u8>, BackendError>;
}

pub struct HttpFetcher {
    precheck_timeout: Duration,
    fetch_timeout: Duration,
    max_bytes: u64,
    /// Built on first use so it is never created inside the async runtime.
    client: OnceCell<reqwest::blocking::Client>,
}

impl HttpFetcher {
    pub fn new(precheck_timeout: Duration, fetch_timeout: Duration, max_bytes: u64) -> Self {
        Self {
            precheck_timeout,
            fetch_timeout,
            max_bytes,
            client: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, BackendError> {
        self.client.get_or_try_init(|| {
            reqwest::blocking::Client::builder()
                .user_agent(USER_AGENT_DEFAULT)
                .pool_idle_timeout(Duration::from_secs(10))
                .build()
                .map_err(BackendError::from)
        })
    }
}

impl ImageFetcher for HttpFetcher {
    fn probe(&self, url: &Url) -> Result<(), BackendError> {
        let response = self
            .client()?
            .head(url.clone())
            .timeout(self.precheck_timeout)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::other(format!("HEAD returned {status}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("image/") {
            return Err(BackendError::other(format!(
                "content-type '{content_type}' is not an image"
            )));
        }

        Ok(())
    }

    fn fetch(&self, url: &Url) -> Result<Vec<u8>, BackendError> {
        let response = self
            .client()?
            .get(url.clone())
            .timeout(self.fetch_timeout)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::other(format!("GET returned {status}")));
        }

        let declared = response.content_length();
        read_capped(response, declared, self.max_bytes)
    }
}

/// Read a response body of at most `limit` bytes. A declared length over the
/// limit is rejected before anything is read.
fn read_capped(body: impl Read, declared: Option<u64>, limit: u64) -> Result<Vec<u8>, BackendError> {
    if let Some(len) = declared.filter(|len| *len > limit) {
        return Err(BackendError::other(format!(
            "image is {len} bytes, limit is {limit}"
        )));
    }

    let mut bytes = Vec::new();
    body.take(limit.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|e| BackendError::network(format!("failed to read image body: {e}")))?;

    if bytes.len() as u64 > limit {
        return Err(BackendError::other(format!(
            "image exceeds the {limit} byte limit"
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    fn data_uri(bytes: &[u8]) -> String {
        format!("data:image/png;base64,{}", STANDARD.encode(bytes))
    }

    #[test]
    fn test_parse_http_urls() {
        let image = ImageRef::parse("https://images.example.com/shoe.jpg?w=400").unwrap();
        assert!(image.is_remote());
        assert_eq!(
            image.cache_key(),
            "https://images.example.com/shoe.jpg?w=400"
        );

        assert!(ImageRef::parse("http://localhost:8080/a.png").is_ok());
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        for raw in ["", "   ", "ftp://example.com/a.png", "/tmp/a.png", "shoe.jpg"] {
            let err = ImageRef::parse(raw).err().unwrap();
            assert!(
                matches!(err, MatchError::InvalidImageReference(_)),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_data_uri() {
        let mut bytes = PNG_MAGIC.to_vec();
        bytes.extend_from_slice(b"payload");

        let image = ImageRef::parse(&data_uri(&bytes)).unwrap();
        match &image {
            ImageRef::Data { media_type, bytes: decoded } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(decoded.as_ref(), bytes.as_slice());
            }
            ImageRef::Remote(_) => panic!("expected data reference"),
        }
        assert!(image.cache_key().starts_with("sha256:"));
    }

    #[test]
    fn test_data_uri_key_is_content_addressed() {
        let bytes = b"same picture".to_vec();
        let plain = data_uri(&bytes);
        let wrapped = plain.replacen(',', ",\n", 1);

        let a = ImageRef::parse(&plain).unwrap();
        let b = ImageRef::parse(&wrapped).unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), content_key(&bytes));
    }

    #[test]
    fn test_data_uri_requires_base64() {
        let err = ImageRef::parse("data:image/png,rawbytes").err().unwrap();
        assert!(matches!(err, MatchError::InvalidImageReference(_)));

        let err = ImageRef::parse("data:image/png;base64,@@@").err().unwrap();
        assert!(matches!(err, MatchError::InvalidImageReference(_)));
    }

    #[test]
    fn test_read_capped_enforces_limit() {
        let body = vec![7u8; 64];

        let read = read_capped(body.as_slice(), Some(64), 64).unwrap();
        assert_eq!(read, body);

        let err = read_capped(body.as_slice(), Some(1 << 30), 64).err().unwrap();
        assert!(err.to_string().contains("limit"));

        // missing or understated length is caught while reading
        assert!(read_capped(body.as_slice(), None, 63).is_err());
        assert!(read_capped(body.as_slice(), Some(10), 63).is_err());
        assert_eq!(read_capped(body.as_slice(), None, 100).unwrap().len(), 64);
    }

    #[test]
    fn test_check_format() {
        let mut png = PNG_MAGIC.to_vec();
        png.extend_from_slice(&[0; 16]);
        assert_eq!(check_format(&png).unwrap(), "image/png");

        let err = check_format(b"<!doctype html><html></html>").err().unwrap();
        assert!(matches!(err, MatchError::ImageFormatUnsupported(_)));

        let pdf = b"%PDF-1.7 something";
        let err = check_format(pdf).err().unwrap();
        assert_eq!(
            err,
            MatchError::ImageFormatUnsupported("application/pdf".to_string())
        );
    }
}
