//! Payload download with per-hash caching and single-flight dedupe.
//!
//! Payloads are identified by their SHA-256, so two apps offered the
//! same payload (or the same app across cycles) download it once. At
//! most one download per hash is in flight; later consumers await the
//! first. A transient failure gets exactly one fallback retry, then
//! fails that consumer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rollout_core::protocol::PayloadRef;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

/// Fetch failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// Connection-level failure.
    #[error("transient download failure: {0}")]
    Transient(String),

    /// Downloaded bytes do not match the advertised hash.
    #[error("payload hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Advertised hex SHA-256.
        expected: String,
        /// Hex SHA-256 of the downloaded bytes.
        actual: String,
    },

    /// Local filesystem failure while staging the payload.
    #[error("payload staging i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads a payload and returns the staged file path.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    /// Fetch `payload` to local storage.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the download or staging fails.
    async fn fetch(&self, payload: &PayloadRef) -> Result<PathBuf, FetchError>;
}

/// HTTP fetcher staging payloads into a directory.
pub struct HttpPayloadFetcher {
    http: reqwest::Client,
    stage_dir: PathBuf,
}

impl HttpPayloadFetcher {
    /// Fetcher staging downloads under `stage_dir`.
    #[must_use]
    pub fn new(http: reqwest::Client, stage_dir: impl Into<PathBuf>) -> Self {
        Self {
            http,
            stage_dir: stage_dir.into(),
        }
    }
}

#[async_trait]
impl PayloadFetcher for HttpPayloadFetcher {
    async fn fetch(&self, payload: &PayloadRef) -> Result<PathBuf, FetchError> {
        let response = self
            .http
            .get(&payload.url)
            .send()
            .await
            .map_err(|err| FetchError::Transient(err.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Transient(format!(
                "http status {}",
                response.status().as_u16()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchError::Transient(err.to_string()))?;
        tokio::fs::create_dir_all(&self.stage_dir).await?;
        let path = self.stage_dir.join(&payload.hash_sha256);
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }
}

/// Hex SHA-256 of a file's contents.
async fn file_sha256(path: &PathBuf) -> Result<String, FetchError> {
    let bytes = tokio::fs::read(path).await?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Verifying, deduplicating wrapper around an inner fetcher.
pub struct CachingFetcher {
    inner: Arc<dyn PayloadFetcher>,
    // One cell per payload hash; the cell holds the staged path once a
    // download verified successfully.
    in_flight: Mutex<HashMap<String, Arc<OnceCell<PathBuf>>>>,
}

impl CachingFetcher {
    /// Wrap `inner` with caching and verification.
    #[must_use]
    pub fn new(inner: Arc<dyn PayloadFetcher>) -> Self {
        Self {
            inner,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_verified(&self, payload: &PayloadRef) -> Result<PathBuf, FetchError> {
        let path = match self.inner.fetch(payload).await {
            Ok(path) => path,
            Err(FetchError::Transient(first)) => {
                tracing::warn!(
                    url = %payload.url,
                    error = %first,
                    "download failed, retrying once"
                );
                self.inner.fetch(payload).await?
            },
            Err(err) => return Err(err),
        };
        let actual = file_sha256(&path).await?;
        if !actual.eq_ignore_ascii_case(&payload.hash_sha256) {
            return Err(FetchError::HashMismatch {
                expected: payload.hash_sha256.clone(),
                actual,
            });
        }
        Ok(path)
    }
}

#[async_trait]
impl PayloadFetcher for CachingFetcher {
    async fn fetch(&self, payload: &PayloadRef) -> Result<PathBuf, FetchError> {
        let cell = {
            let mut map = self.in_flight.lock().await;
            Arc::clone(
                map.entry(payload.hash_sha256.to_ascii_lowercase())
                    .or_default(),
            )
        };
        // A failed attempt leaves the cell empty, so the next consumer
        // starts a fresh download instead of inheriting the error.
        let path = cell
            .get_or_try_init(|| self.fetch_verified(payload))
            .await?;
        Ok(path.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingFetcher {
        dir: tempfile::TempDir,
        calls: AtomicUsize,
        transient_failures: AtomicUsize,
        content: Vec<u8>,
    }

    impl CountingFetcher {
        fn new(content: &[u8], transient_failures: usize) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                calls: AtomicUsize::new(0),
                transient_failures: AtomicUsize::new(transient_failures),
                content: content.to_vec(),
            }
        }
    }

    #[async_trait]
    impl PayloadFetcher for CountingFetcher {
        async fn fetch(&self, payload: &PayloadRef) -> Result<PathBuf, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FetchError::Transient("connection reset".into()));
            }
            let path = self.dir.path().join(&payload.hash_sha256);
            std::fs::write(&path, &self.content)?;
            Ok(path)
        }
    }

    fn payload_for(content: &[u8]) -> PayloadRef {
        let hash: String = Sha256::digest(content)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        PayloadRef {
            url: "http://example.test/p.crx".into(),
            hash_sha256: hash,
        }
    }

    #[tokio::test]
    async fn dedupes_by_hash() {
        let inner = Arc::new(CountingFetcher::new(b"payload", 0));
        let fetcher = CachingFetcher::new(Arc::clone(&inner) as Arc<dyn PayloadFetcher>);
        let payload = payload_for(b"payload");

        let first = fetcher.fetch(&payload).await.unwrap();
        let second = fetcher.fetch(&payload).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failure_once() {
        let inner = Arc::new(CountingFetcher::new(b"payload", 1));
        let fetcher = CachingFetcher::new(Arc::clone(&inner) as Arc<dyn PayloadFetcher>);
        let payload = payload_for(b"payload");

        fetcher.fetch(&payload).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_consecutive_transient_failure_surfaces() {
        let inner = Arc::new(CountingFetcher::new(b"payload", 2));
        let fetcher = CachingFetcher::new(Arc::clone(&inner) as Arc<dyn PayloadFetcher>);
        let payload = payload_for(b"payload");

        assert!(matches!(
            fetcher.fetch(&payload).await,
            Err(FetchError::Transient(_))
        ));
        // A later attempt starts over and succeeds.
        fetcher.fetch(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_hash_mismatch() {
        let inner = Arc::new(CountingFetcher::new(b"actual bytes", 0));
        let fetcher = CachingFetcher::new(inner as Arc<dyn PayloadFetcher>);
        let payload = payload_for(b"expected bytes");

        assert!(matches!(
            fetcher.fetch(&payload).await,
            Err(FetchError::HashMismatch { .. })
        ));
    }
}
