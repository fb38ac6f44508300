//! Document blob fetching.
//!
//! A locator is either a path relative to the configured storage root or an
//! http(s) URL. Fetch failures are surfaced to the Context Assembler, which
//! degrades to an ungrounded reply instead of failing the message.

use anyhow::{Context, bail};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Raw bytes for a locator, or an error when the blob is unreachable.
    async fn fetch(&self, locator: &str) -> anyhow::Result<Vec<u8>>;
}

/// Filesystem-backed blobs under a fixed root.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a locator inside the root, rejecting traversal out of it.
    fn resolve(&self, locator: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(locator);
        if relative.is_absolute() {
            bail!("absolute blob locator not allowed: {locator}");
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!("blob locator escapes storage root: {locator}"),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn fetch(&self, locator: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(locator)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("read blob {}", path.display()))
    }
}

/// HTTP-backed blobs for url locators.
pub struct HttpBlobStore {
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn fetch(&self, locator: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .get(locator)
            .send()
            .await
            .with_context(|| format!("fetch blob {locator}"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("blob fetch {locator} returned {status}");
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("read blob body {locator}"))?;
        Ok(bytes.to_vec())
    }
}

/// Dispatches on the locator scheme: http(s) URLs go to the HTTP store,
/// everything else resolves against the filesystem root.
pub struct RoutingBlobStore {
    fs: FsBlobStore,
    http: HttpBlobStore,
}

impl RoutingBlobStore {
    pub fn new(root: impl Into<PathBuf>, http_timeout: Duration) -> Self {
        Self {
            fs: FsBlobStore::new(root),
            http: HttpBlobStore::new(http_timeout),
        }
    }
}

#[async_trait]
impl BlobStore for RoutingBlobStore {
    async fn fetch(&self, locator: &str) -> anyhow::Result<Vec<u8>> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            self.http.fetch(locator).await
        } else {
            self.fs.fetch(locator).await
        }
    }
}

/// Decode blob bytes as document text. Content is assumed UTF-8-compatible;
/// invalid sequences are replaced rather than failing the message.
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

pub fn blob_store_for(config: &crate::config::StorageConfig) -> Arc<dyn BlobStore> {
    Arc::new(RoutingBlobStore::new(
        config.root.clone(),
        Duration::from_secs(30),
    ))
}
