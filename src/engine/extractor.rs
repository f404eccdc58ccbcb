//! Single-image feature extraction.
//!
//! Order of work for one reference:
//! - image-cache hit returns immediately
//! - reference is validated (data URI or http/https URL)
//! - remote images get an advisory HEAD pre-check, then are downloaded
//! - the payload is sniffed, handed to the model and the output sanity-checked
//! - the vector is cached under the reference's key
//!
//! Transient failures are retried with a linearly growing delay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::engine::backend::ModelBackend;
use crate::engine::cache::{Embedding, ImageCache};
use crate::engine::errors::MatchError;
use crate::engine::model::ModelManager;
use crate::engine::source::{check_format, ImageFetcher, ImageRef};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before retry `n` is `n * base_delay`.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Total attempts, the first one included.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Saturates at `Duration::MAX`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.checked_mul(attempt).unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(1000),
        }
    }
}

pub struct FeatureExtractor {
    models: Arc<ModelManager>,
    fetcher: Arc<dyn ImageFetcher>,
    cache: Arc<ImageCache>,
    retry: RetryPolicy,
    /// One async lock per key being extracted, so concurrent callers for the
    /// same image share a single backend call.
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FeatureExtractor {
    pub fn new(
        models: Arc<ModelManager>,
        fetcher: Arc<dyn ImageFetcher>,
        cache: Arc<ImageCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            models,
            fetcher,
            cache,
            retry,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Feature vector for `raw`, from cache or from the model.
    pub async fn extract(&self, raw: &str) -> Result<Embedding, MatchError> {
        if let Some(hit) = self.cache.get(raw) {
            log::debug!("using cached features for {}", abbreviate(raw));
            return Ok(hit);
        }

        let image = ImageRef::parse(raw)?;
        let key = image.cache_key();

        let key_lock = self.key_lock(&key);
        let result = {
            let _guard = key_lock.lock().await;

            // someone else may have finished while we waited
            if let Some(hit) = self.cache.get(key.as_str()) {
                log::debug!("using cached features for {image}");
                Ok(hit)
            } else {
                self.extract_uncached(&image, &key).await
            }
        };
        self.release_key_lock(&key, key_lock);

        result
    }

    async fn extract_uncached(&self, image: &ImageRef, key: &str) -> Result<Embedding, MatchError> {
        let backend = self.models.ensure_ready().await?;

        let attempts = self.retry.attempts();
        let mut attempt = 0;
        let embedding = loop {
            attempt += 1;
            match self.attempt(backend.clone(), image.clone()).await {
                Ok(embedding) => break embedding,
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "image processing attempt {attempt}/{attempts} for {image} failed: {err}, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_retryable() => {
                    log::error!("giving up on {image} after {attempts} attempts: {err}");
                    return Err(exhausted(err, attempts));
                }
                Err(err) => return Err(err),
            }
        };

        log::debug!(
            "extracted {} features from {image}",
            embedding.dimensions()
        );
        self.cache.put(key.to_string(), embedding.clone());
        Ok(embedding)
    }

    /// One attempt on the blocking pool: network and model calls both block.
    async fn attempt(
        &self,
        backend: Arc<dyn ModelBackend>,
        image: ImageRef,
    ) -> Result<Embedding, MatchError> {
        let fetcher = self.fetcher.clone();
        tokio::task::spawn_blocking(move || run_extraction(backend.as_ref(), fetcher.as_ref(), &image))
            .await
            .map_err(|e| MatchError::ExtractionFailed(format!("extraction task failed: {e}")))?
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }

    fn release_key_lock(&self, key: &str, key_lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // the map and this caller hold the only references
        if Arc::strong_count(&key_lock) <= 2 {
            locks.remove(key);
        }
    }
}

fn run_extraction(
    backend: &dyn ModelBackend,
    fetcher: &dyn ImageFetcher,
    image: &ImageRef,
) -> Result<Embedding, MatchError> {
    let downloaded;
    let bytes: &[u8] = match image {
        ImageRef::Data { bytes, .. } => &bytes[..],
        ImageRef::Remote(url) => {
            if let Err(err) = fetcher.probe(url) {
                log::warn!("failed to validate image URL {url}: {err}; continuing anyway");
            }
            downloaded = fetcher
                .fetch(url)
                .map_err(|e| MatchError::ImageInaccessible(format!("{url}: {e}")))?;
            &downloaded
        }
    };

    check_format(bytes)?;

    let values = backend
        .extract(bytes)
        .map_err(|e| MatchError::ExtractionFailed(e.to_string()))?;

    validate_output(values, backend.dimensions())
}

/// Reject empty or wrongly sized output; tolerate a minority of NaN/inf values.
fn validate_output(values: Vec<f32>, expected: usize) -> Result<Embedding, MatchError> {
    if values.is_empty() {
        return Err(MatchError::ExtractionFailed(
            "no features extracted from image".to_string(),
        ));
    }

    if expected != 0 && values.len() != expected {
        return Err(MatchError::VectorLengthMismatch {
            expected,
            got: values.len(),
        });
    }

    let embedding = Embedding::new(values);
    let invalid = embedding.non_finite_count();
    if invalid == embedding.dimensions() {
        return Err(MatchError::ExtractionFailed(
            "model returned only non-finite values".to_string(),
        ));
    }
    if invalid > 0 {
        log::warn!(
            "found {invalid} invalid feature values out of {}",
            embedding.dimensions()
        );
    }

    Ok(embedding)
}

fn exhausted(err: MatchError, attempts: u32) -> MatchError {
    match err {
        MatchError::ExtractionFailed(last) => MatchError::ExtractionExhausted { attempts, last },
        other => other,
    }
}

/// Data URIs are long; keep log lines readable.
fn abbreviate(raw: &str) -> &str {
    match raw.char_indices().nth(80) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}
