//! Firmware retrieval.
//!
//! Catalog locators are relative paths. They are resolved against either an
//! HTTP(S) base URL or a local directory and always read fully into memory.

use std::future::Future;
use std::path::PathBuf;

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, Url};
use sha2::{Digest, Sha256};

use crate::error::FetchError;

/// Something that can produce the bytes behind a catalog locator.
pub trait FirmwareSource {
    fn fetch(&self, locator: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// Firmware bytes in the programmer's transfer encoding.
///
/// The encoding is the identity: one unit per raw byte, nothing compressed
/// here. Compression on the wire is the programmer's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    pub fn encode(raw: Vec<u8>) -> Self {
        Self { data: raw }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Integrity hook run over the image before it is written.
///
/// Returns a digest string to log alongside the write, or `None` when the
/// hook does not compute one.
pub trait ImageDigest: Send + Sync {
    fn digest(&self, image: &FirmwareImage) -> Option<String>;
}

/// Computes nothing. The device-side verification is also left off.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipDigest;

impl ImageDigest for SkipDigest {
    fn digest(&self, _image: &FirmwareImage) -> Option<String> {
        tracing::debug!("Image digest not computed");
        None
    }
}

/// SHA-256 of the image, for the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Digest;

impl ImageDigest for Sha256Digest {
    fn digest(&self, image: &FirmwareImage) -> Option<String> {
        let mut hasher = Sha256::new();
        hasher.update(image.as_bytes());
        Some(hex::encode(hasher.finalize()))
    }
}

/// Fetches firmware over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    base: Url,
    show_progress: bool,
}

impl HttpSource {
    pub fn new(base: &str) -> Result<Self, FetchError> {
        // Url::join drops the last path segment unless it ends in '/'.
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        let base = Url::parse(&base).map_err(|e| FetchError::Locator(format!("{base}: {e}")))?;
        let client = Client::builder().user_agent("bitaxe-flasher").build()?;
        Ok(Self {
            client,
            base,
            show_progress: false,
        })
    }

    /// Draw a download bar on stderr while fetching.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn url_for(&self, locator: &str) -> Result<Url, FetchError> {
        self.base
            .join(locator)
            .map_err(|e| FetchError::Locator(format!("{locator}: {e}")))
    }

    async fn download(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        let url = self.url_for(locator)?;
        tracing::info!("Downloading firmware from {url}");

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let total = response.content_length().unwrap_or(0);
        let pb = if self.show_progress {
            let pb = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut data = Vec::with_capacity(total as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            data.extend_from_slice(&chunk);
            pb.set_position(data.len() as u64);
        }
        pb.finish_and_clear();

        Ok(data)
    }
}

impl FirmwareSource for HttpSource {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        self.download(locator).await
    }
}

/// Reads firmware from a local directory.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, locator: &str) -> Result<PathBuf, FetchError> {
        let rel = std::path::Path::new(locator);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(FetchError::Locator(locator.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

impl FirmwareSource for DirSource {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        let path = self.path_for(locator)?;
        tracing::info!("Reading firmware from {}", path.display());
        Ok(tokio::fs::read(&path).await?)
    }
}

/// The configured firmware origin.
#[derive(Debug, Clone)]
pub enum FirmwareStore {
    Http(HttpSource),
    Dir(DirSource),
}

impl FirmwareStore {
    /// `http://` and `https://` bases are fetched remotely, anything else is
    /// treated as a directory.
    pub fn from_base(base: &str, show_progress: bool) -> Result<Self, FetchError> {
        if base.starts_with("http://") || base.starts_with("https://") {
            Ok(Self::Http(HttpSource::new(base)?.with_progress(show_progress)))
        } else {
            Ok(Self::Dir(DirSource::new(base)))
        }
    }
}

impl FirmwareSource for FirmwareStore {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        match self {
            FirmwareStore::Http(s) => s.fetch(locator).await,
            FirmwareStore::Dir(s) => s.fetch(locator).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_locator_join() {
        let src = HttpSource::new("https://example.com/bitaxe").unwrap();
        assert_eq!(
            src.url_for("firmware/esp-miner-factory-203-v2.3.0.bin")
                .unwrap()
                .as_str(),
            "https://example.com/bitaxe/firmware/esp-miner-factory-203-v2.3.0.bin"
        );
    }

    #[test]
    fn test_store_from_base() {
        assert!(matches!(
            FirmwareStore::from_base("https://example.com/", false).unwrap(),
            FirmwareStore::Http(_)
        ));
        assert!(matches!(
            FirmwareStore::from_base("./public", false).unwrap(),
            FirmwareStore::Dir(_)
        ));
    }

    #[test]
    fn test_dir_rejects_escaping_locators() {
        let src = DirSource::new("/srv/fw");
        assert!(src.path_for("../secret.bin").is_err());
        assert!(src.path_for("/etc/passwd").is_err());
        assert_eq!(
            src.path_for("firmware/a.bin").unwrap(),
            PathBuf::from("/srv/fw/firmware/a.bin")
        );
    }

    #[tokio::test]
    async fn test_dir_fetch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("firmware")).unwrap();
        std::fs::write(dir.path().join("firmware/x.bin"), [0u8, 1, 2, 0xff]).unwrap();

        let src = DirSource::new(dir.path());
        assert_eq!(src.fetch("firmware/x.bin").await.unwrap(), vec![0, 1, 2, 0xff]);
        assert!(matches!(
            src.fetch("firmware/missing.bin").await,
            Err(FetchError::Io(_))
        ));
    }

    #[test]
    fn test_image_encoding_is_identity() {
        let raw: Vec<u8> = (0..=255).collect();
        let image = FirmwareImage::encode(raw.clone());
        assert_eq!(image.len(), 256);
        assert_eq!(image.as_bytes(), raw.as_slice());
    }

    #[test]
    fn test_digest_hooks() {
        let image = FirmwareImage::encode(b"abc".to_vec());
        assert_eq!(SkipDigest.digest(&image), None);
        assert_eq!(
            Sha256Digest.digest(&image).as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }
}
