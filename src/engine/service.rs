//! Engine context: owns the model manager, both caches and the collaborators
//! built on them, and implements the query flow used by the CLI and the API.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::catalog::Product;
use crate::config::{Config, MatchingConfig};
use crate::engine::backend::{FastembedLoader, ModelBackend, ModelLoader};
use crate::engine::batch::{BatchPrecomputer, FillReport};
use crate::engine::cache::{Embedding, ImageCache, ProductCache};
use crate::engine::errors::MatchError;
use crate::engine::extractor::FeatureExtractor;
use crate::engine::fallback::FallbackProvider;
use crate::engine::model::{ModelManager, ModelStatus};
use crate::engine::similarity::{enhanced_similarity, rank, RankedResult};
use crate::engine::source::{HttpFetcher, ImageFetcher, ImageRef};

const FALLBACK_NOTICE: &str = "AI matching is unavailable; showing products in random order";
const NO_MATCHES_NOTICE: &str = "No similar products found";

/// Answer to one match request.
#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub results: Vec<RankedResult>,
    /// Scores are random, not derived from the image.
    pub degraded: bool,
    /// Threshold the results passed; absent in degraded mode.
    pub threshold: Option<f32>,
    pub notice: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub model: ModelStatus,
    pub image_cache: usize,
    pub product_cache: usize,
    /// Catalog items whose vector could not be computed.
    pub unavailable_products: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfTestReport {
    pub ok: bool,
    pub model: Option<String>,
    pub dimensions: Option<usize>,
    pub error: Option<String>,
}

pub struct MatchEngine {
    models: Arc<ModelManager>,
    extractor: Arc<FeatureExtractor>,
    images: Arc<ImageCache>,
    products: Arc<ProductCache>,
    precomputer: BatchPrecomputer,
    /// Products that failed extraction, with the reason. Queries score them 0
    /// without retrying; `precompute`, `clear_caches` and `reload` give them
    /// another chance.
    unavailable: Mutex<BTreeMap<u64, String>>,
    fallback: FallbackProvider,
    matching: MatchingConfig,
}

impl MatchEngine {
    pub fn new(
        config: &Config,
        loader: Arc<dyn ModelLoader>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        let models = Arc::new(ModelManager::new(
            loader,
            config.model.configurations.clone(),
            config.model.load_timeout(),
        ));
        let images = Arc::new(ImageCache::new("images"));
        let products = Arc::new(ProductCache::new("products"));
        let extractor = Arc::new(FeatureExtractor::new(
            models.clone(),
            fetcher,
            images.clone(),
            config.extraction.retry_policy(),
        ));
        let precomputer = BatchPrecomputer::new(
            extractor.clone(),
            products.clone(),
            config.batch.batch_size,
            config.batch.pacing_delay(),
        );

        Self {
            models,
            extractor,
            images,
            products,
            precomputer,
            unavailable: Mutex::new(BTreeMap::new()),
            fallback: FallbackProvider::new(config.fallback.min_score, config.fallback.max_score),
            matching: config.matching.clone(),
        }
    }

    /// Engine backed by fastembed models cached under the config's base path
    /// and a real HTTP client.
    pub fn from_config(config: &Config) -> Self {
        let loader = Arc::new(FastembedLoader::new(
            config.base_path().to_path_buf(),
            config.model.show_download_progress,
        ));
        let fetcher = Arc::new(HttpFetcher::new(
            config.extraction.precheck_timeout(),
            config.extraction.fetch_timeout(),
            config.extraction.max_image_bytes,
        ));
        Self::new(config, loader, fetcher)
    }

    pub async fn ensure_ready(&self) -> Result<Arc<dyn ModelBackend>, MatchError> {
        self.models.ensure_ready().await
    }

    /// Load the model, then fill the product cache for `catalog`.
    pub async fn precompute(&self, catalog: &[Product]) -> Result<FillReport, MatchError> {
        self.ensure_ready().await?;
        let report = self.precomputer.fill(catalog).await;
        self.record_failures(&report.failed);
        Ok(report)
    }

    /// Rank `catalog` against `image`, keeping results at or above
    /// `min_similarity`.
    pub async fn find_similar(
        &self,
        image: &str,
        catalog: &[Product],
        min_similarity: f32,
    ) -> Result<Vec<RankedResult>, MatchError> {
        let scored = self.score_catalog(image, catalog).await?;
        Ok(rank(scored, min_similarity))
    }

    /// Caller-level policy: an explicit threshold is used as-is; otherwise the
    /// configured threshold is tried first and relaxed once if nothing passes.
    /// When the model or the query extraction fails, random scores are
    /// returned instead and the outcome is flagged as degraded.
    ///
    /// Only unusable input is reported as an error.
    pub async fn match_image(
        &self,
        image: &str,
        catalog: &[Product],
        threshold: Option<f32>,
    ) -> Result<MatchOutcome, MatchError> {
        let scored = match self.score_catalog(image, catalog).await {
            Ok(scored) => scored,
            Err(err) if err.is_input_error() => return Err(err),
            Err(err) => {
                log::warn!("falling back to random scores: {err}");
                return Ok(self.fallback(catalog, Some(err.to_string())));
            }
        };

        let primary = threshold
            .map(|t| t.clamp(0.0, 1.0))
            .unwrap_or(self.matching.min_similarity);
        let mut results = rank(scored.clone(), primary);
        let mut used = primary;

        if results.is_empty() && threshold.is_none() && self.matching.relaxed_similarity < primary {
            used = self.matching.relaxed_similarity;
            log::info!("no matches at {primary}, retrying at {used}");
            results = rank(scored, used);
        }

        let notice = results.is_empty().then(|| NO_MATCHES_NOTICE.to_string());
        Ok(MatchOutcome {
            results,
            degraded: false,
            threshold: Some(used),
            notice,
        })
    }

    /// Degraded-mode answer. `reason` is appended to the notice.
    pub fn fallback(&self, catalog: &[Product], reason: Option<String>) -> MatchOutcome {
        let notice = match reason {
            Some(reason) => format!("{FALLBACK_NOTICE}: {reason}"),
            None => FALLBACK_NOTICE.to_string(),
        };
        MatchOutcome {
            results: self.fallback.score(catalog),
            degraded: true,
            threshold: None,
            notice: Some(notice),
        }
    }

    /// Extract `image` end to end and report whether a usable vector came back.
    pub async fn self_test(&self, image: &str) -> SelfTestReport {
        let result = self.extractor.extract(image).await;
        let status = self.models.status();

        match result {
            Ok(embedding) => {
                log::info!(
                    "self-test passed: {} features from {}",
                    embedding.dimensions(),
                    status.model.as_deref().unwrap_or("unknown model")
                );
                SelfTestReport {
                    ok: embedding.dimensions() > 0,
                    model: status.model,
                    dimensions: Some(embedding.dimensions()),
                    error: None,
                }
            }
            Err(err) => {
                log::error!("self-test failed: {err}");
                SelfTestReport {
                    ok: false,
                    model: status.model,
                    dimensions: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            model: self.models.status(),
            image_cache: self.images.len(),
            product_cache: self.products.len(),
            unavailable_products: self.unavailable().len(),
        }
    }

    pub fn clear_caches(&self) {
        self.images.clear();
        self.products.clear();
        self.unavailable().clear();
        log::info!("cleared image and product caches");
    }

    /// Back to a freshly constructed engine.
    pub fn reset(&self) {
        self.clear_caches();
        self.models.reset();
    }

    /// Reload the model. Cached vectors are dropped once the load settles,
    /// since a different model may produce vectors of another length.
    pub async fn reload(&self) -> Result<ModelStatus, MatchError> {
        let loaded = self.models.reload().await;
        self.clear_caches();
        loaded?;
        Ok(self.models.status())
    }

    /// Score every catalog item against `image` without filtering.
    ///
    /// Fails if the model is unavailable or the query cannot be extracted.
    /// Catalog items without a vector score 0.
    async fn score_catalog(
        &self,
        image: &str,
        catalog: &[Product],
    ) -> Result<Vec<RankedResult>, MatchError> {
        // bad input is reported as such even while the model is unavailable
        ImageRef::parse(image)?;
        self.ensure_ready().await?;
        let query = self.extractor.extract(image).await?;
        self.evict_stale(catalog, query.dimensions());

        let missing: Vec<Product> = {
            let unavailable = self.unavailable();
            catalog
                .iter()
                .filter(|p| !self.products.has(&p.id) && !unavailable.contains_key(&p.id))
                .cloned()
                .collect()
        };
        if !missing.is_empty() {
            let report = self.precomputer.fill(&missing).await;
            self.record_failures(&report.failed);
        }

        let mut results = Vec::with_capacity(catalog.len());
        for product in catalog {
            let similarity = match self.product_vector(product).await {
                Some(vector) => {
                    match enhanced_similarity(query.as_slice(), vector.as_slice(), &product.category) {
                        Ok(score) => score,
                        Err(err) => {
                            log::warn!("cannot compare product {}: {err}", product.id);
                            0.0
                        }
                    }
                }
                None => 0.0,
            };

            results.push(RankedResult {
                product: product.clone(),
                similarity,
            });
        }

        Ok(results)
    }

    /// Cached vector for `product`, extracting it on demand unless it is
    /// already known to fail.
    async fn product_vector(&self, product: &Product) -> Option<Embedding> {
        if let Some(vector) = self.products.get(&product.id) {
            return Some(vector);
        }
        if self.unavailable().contains_key(&product.id) {
            return None;
        }

        match self.extractor.extract(&product.image_url).await {
            Ok(vector) => {
                self.products.put(product.id, vector.clone());
                Some(vector)
            }
            Err(err) => {
                log::warn!("no vector for product {}: {err}", product.id);
                self.unavailable().insert(product.id, err.to_string());
                None
            }
        }
    }

    /// Drop product vectors whose length differs from the query's, so the next
    /// fill recomputes them with the current model.
    fn evict_stale(&self, catalog: &[Product], dimensions: usize) {
        for product in catalog {
            let stale = self
                .products
                .get(&product.id)
                .is_some_and(|v| v.dimensions() != dimensions);
            if stale {
                log::warn!(
                    "evicting vector for product {} with a length other than {dimensions}",
                    product.id
                );
                self.products.remove(&product.id);
            }
        }
    }

    /// Remember failed products; anything cached since is available again.
    fn record_failures(&self, failed: &BTreeMap<u64, String>) {
        let mut unavailable = self.unavailable();
        unavailable.retain(|id, _| !self.products.has(id));
        unavailable.extend(failed.iter().map(|(id, reason)| (*id, reason.clone())));
    }

    fn unavailable(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, String>> {
        self.unavailable.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
