//! Turns image references into raw image bytes.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};

use crate::models::catalog::ImageReference;

/// Default cap on a single image payload.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Where a reference points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceKind<'a> {
    /// Inline `data:` URI.
    DataUri(&'a str),
    /// Remote `http(s)` URL.
    Url(&'a str),
    /// Web path such as `/images/shoe.jpg`, served from the image root.
    WebPath(&'a str),
    /// Local file path. Only catalog entries may use these.
    File(PathBuf),
}

/// Fetches image bytes for data URIs, URLs, web paths and local files.
#[derive(Debug, Clone)]
pub struct ImageResolver {
    client: reqwest::Client,
    image_root: PathBuf,
    max_bytes: usize,
}

impl Default for ImageResolver {
    fn default() -> Self {
        Self::new("public", Duration::from_secs(20), DEFAULT_MAX_IMAGE_BYTES)
    }
}

impl ImageResolver {
    /// Creates a resolver.
    ///
    /// `image_root` is the directory web paths such as `/images/shoe.jpg` are
    /// served from; `timeout` bounds each HTTP request.
    pub fn new(image_root: impl Into<PathBuf>, timeout: Duration, max_bytes: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        Self {
            client,
            image_root: image_root.into(),
            max_bytes,
        }
    }

    /// Classifies a reference.
    pub fn classify<'a>(&self, reference: &'a ImageReference) -> ReferenceKind<'a> {
        let raw = reference.as_str();
        if reference.is_data_uri() {
            ReferenceKind::DataUri(raw)
        } else if raw.starts_with("http://") || raw.starts_with("https://") {
            ReferenceKind::Url(raw)
        } else if let Some(path) = raw.strip_prefix("file://") {
            ReferenceKind::File(PathBuf::from(path))
        } else if raw.starts_with('/') {
            ReferenceKind::WebPath(raw)
        } else {
            ReferenceKind::File(PathBuf::from(raw))
        }
    }

    /// Rejects references a client must not be able to point at: local
    /// files outside the image root.
    pub fn ensure_public(&self, reference: &ImageReference) -> Result<()> {
        match self.classify(reference) {
            ReferenceKind::File(_) => bail!("local file references are not accepted"),
            ReferenceKind::WebPath(web_path) => web_relative(web_path).map(|_| ()),
            ReferenceKind::DataUri(_) | ReferenceKind::Url(_) => Ok(()),
        }
    }

    /// Loads the encoded image bytes behind `reference`.
    pub async fn fetch(&self, reference: &ImageReference) -> Result<Bytes> {
        let bytes = match self.classify(reference) {
            ReferenceKind::DataUri(uri) => decode_data_uri(uri)?,
            ReferenceKind::Url(url) => self.fetch_url(url).await?,
            ReferenceKind::WebPath(web_path) => self.read_web_path(web_path).await?,
            ReferenceKind::File(path) => tokio::fs::read(&path)
                .await
                .map(Bytes::from)
                .with_context(|| format!("reading {}", path.display()))?,
        };

        if bytes.is_empty() {
            bail!("image is empty");
        }
        if bytes.len() > self.max_bytes {
            bail!("image is {} bytes, limit is {}", bytes.len(), self.max_bytes);
        }
        Ok(bytes)
    }

    async fn read_web_path(&self, web_path: &str) -> Result<Bytes> {
        let relative = web_relative(web_path)?;
        let root = tokio::fs::canonicalize(&self.image_root)
            .await
            .context("image root is not readable")?;
        let resolved = tokio::fs::canonicalize(root.join(relative))
            .await
            .with_context(|| format!("reading {}", web_path))?;
        // symlinks inside the root may still point elsewhere
        if !resolved.starts_with(&root) {
            bail!("{} escapes the image root", web_path);
        }

        let bytes = tokio::fs::read(&resolved)
            .await
            .with_context(|| format!("reading {}", web_path))?;
        Ok(Bytes::from(bytes))
    }

    async fn fetch_url(&self, url: &str) -> Result<Bytes> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("requesting {}", url))?
            .error_for_status()?;

        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                bail!("image is {} bytes, limit is {}", length, self.max_bytes);
            }
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_bytes {
                bail!("image exceeds the {} byte limit", self.max_bytes);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

/// Path of a web reference relative to the image root; anything but plain
/// name segments is refused.
fn web_relative(web_path: &str) -> Result<&Path> {
    let relative = Path::new(web_path.trim_start_matches('/'));
    if relative.as_os_str().is_empty()
        || relative.components().any(|c| !matches!(c, Component::Normal(_)))
    {
        bail!("{} escapes the image root", web_path);
    }
    Ok(relative)
}

/// Decodes the payload of a base64 `data:` URI.
pub fn decode_data_uri(uri: &str) -> Result<Bytes> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("not a data URI"))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("data URI has no payload"))?;
    if !meta.split(';').any(|part| part.eq_ignore_ascii_case("base64")) {
        bail!("only base64 data URIs are supported");
    }

    let decoded = STANDARD
        .decode(payload.trim())
        .context("data URI payload is not valid base64")?;
    Ok(Bytes::from(decoded))
}

/// Encodes bytes as a base64 `data:` URI.
pub fn encode_data_uri(mime: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_uri_round_trip() {
        let uri = encode_data_uri("image/png", b"\x89PNG fake");
        assert!(uri.starts_with("data:image/png;base64,"));
        assert_eq!(decode_data_uri(&uri).unwrap().as_ref(), b"\x89PNG fake");
    }

    #[test]
    fn test_rejects_bad_data_uris() {
        assert!(decode_data_uri("data:image/png,rawbytes").is_err());
        assert!(decode_data_uri("data:image/png;base64").is_err());
        assert!(decode_data_uri("data:image/png;base64,!!!").is_err());
    }

    #[test]
    fn test_classify() {
        let resolver = ImageResolver::new("/srv/public", Duration::from_secs(1), 1024);

        let data = ImageReference::new("data:image/png;base64,AAAA");
        assert!(matches!(resolver.classify(&data), ReferenceKind::DataUri(_)));

        let url = ImageReference::new("https://cdn.example.com/a.jpg");
        assert_eq!(resolver.classify(&url), ReferenceKind::Url("https://cdn.example.com/a.jpg"));

        let web = ImageReference::new("/images/shoe.jpg");
        assert_eq!(resolver.classify(&web), ReferenceKind::WebPath("/images/shoe.jpg"));

        let file = ImageReference::new("file:///srv/catalog/a.jpg");
        assert_eq!(resolver.classify(&file), ReferenceKind::File(PathBuf::from("/srv/catalog/a.jpg")));

        let relative = ImageReference::new("photos/a.jpg");
        assert_eq!(resolver.classify(&relative), ReferenceKind::File(PathBuf::from("photos/a.jpg")));
    }

    #[tokio::test]
    async fn test_fetch_enforces_limits() {
        let resolver = ImageResolver::new("public", Duration::from_secs(1), 4);

        let too_big = ImageReference::new(encode_data_uri("image/png", b"12345"));
        assert!(resolver.fetch(&too_big).await.is_err());

        let empty = ImageReference::new("data:image/png;base64,");
        assert!(resolver.fetch(&empty).await.is_err());

        let ok = ImageReference::new(encode_data_uri("image/png", b"1234"));
        assert_eq!(resolver.fetch(&ok).await.unwrap().len(), 4);

        let missing = ImageReference::new("definitely/not/here.png");
        assert!(resolver.fetch(&missing).await.is_err());
    }
    #[tokio::test]
    async fn test_fetch_web_path_under_image_root() {
        use assert_fs::prelude::*;
        use predicates::prelude::*;

        let root = assert_fs::TempDir::new().unwrap();
        let photo = root.child("images/mug.png");
        photo.write_binary(b"not really a png").unwrap();
        photo.assert(predicate::path::exists());

        let resolver = ImageResolver::new(root.path(), Duration::from_secs(1), 1024);
        let bytes = resolver
            .fetch(&ImageReference::new("/images/mug.png"))
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), b"not really a png");
    }
    #[test]
    fn test_ensure_public() {
        let resolver = ImageResolver::default();
        let accepted = ["data:image/png;base64,AAAA", "https://cdn.example.com/a.jpg", "/images/a.jpg"];
        for raw in accepted {
            assert!(resolver.ensure_public(&ImageReference::new(raw)).is_ok(), "{}", raw);
        }

        let refused = ["file:///etc/passwd", "relative/a.jpg", "/images/../../etc/passwd", "/", "/./a.jpg"];
        for raw in refused {
            assert!(resolver.ensure_public(&ImageReference::new(raw)).is_err(), "{}", raw);
        }
    }

    #[tokio::test]
    async fn test_web_path_cannot_leave_image_root() {
        use assert_fs::prelude::*;

        let outside = assert_fs::TempDir::new().unwrap();
        outside.child("secret.png").write_binary(b"secret").unwrap();
        let root = outside.child("public");
        root.create_dir_all().unwrap();

        let resolver = ImageResolver::new(root.path(), Duration::from_secs(1), 1024);
        let err = resolver
            .fetch(&ImageReference::new("/../secret.png"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("escapes the image root"));
    }

    #[tokio::test]
    async fn test_streamed_body_over_limit() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            // chunked, so no Content-Length to check up front
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
                .await;
            for _ in 0..4 {
                let _ = socket.write_all(b"8\r\n01234567\r\n").await;
            }
            let _ = socket.write_all(b"0\r\n\r\n").await;
        });

        let resolver = ImageResolver::new("public", Duration::from_secs(5), 16);
        let url = ImageReference::new(format!("http://{}/big.png", addr));
        let err = resolver.fetch(&url).await.unwrap_err();
        assert!(err.to_string().contains("16 byte limit"));
    }
}
