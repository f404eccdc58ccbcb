//! Catalog pre-computation.
//!
//! Products are extracted in fixed-size batches. Extractions inside a batch run
//! concurrently; batches run one after another with a pacing delay in between.
//! A failing product is recorded in the report and never aborts the fill.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::catalog::Product;
use crate::engine::cache::ProductCache;
use crate::engine::extractor::FeatureExtractor;

/// Outcome of one `fill` pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FillReport {
    pub total: usize,
    /// Already cached before this pass.
    pub skipped: usize,
    pub succeeded: usize,
    /// Product id to the reason it has no vector.
    pub failed: BTreeMap<u64, String>,
    pub batches: usize,
}

impl FillReport {
    /// Every product is either cached or has a recorded failure.
    pub fn is_complete(&self) -> bool {
        self.skipped + self.succeeded + self.failed.len() == self.total
    }
}

pub struct BatchPrecomputer {
    extractor: Arc<FeatureExtractor>,
    products: Arc<ProductCache>,
    batch_size: usize,
    pacing_delay: Duration,
}

impl BatchPrecomputer {
    pub fn new(
        extractor: Arc<FeatureExtractor>,
        products: Arc<ProductCache>,
        batch_size: usize,
        pacing_delay: Duration,
    ) -> Self {
        Self {
            extractor,
            products,
            batch_size: batch_size.max(1),
            pacing_delay,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Compute vectors for every product not yet in the product cache.
    pub async fn fill(&self, catalog: &[Product]) -> FillReport {
        let mut report = FillReport {
            total: catalog.len(),
            ..Default::default()
        };

        let mut seen = HashSet::with_capacity(catalog.len());
        let pending: Vec<&Product> = catalog
            .iter()
            .filter(|p| seen.insert(p.id))
            .filter(|p| {
                let cached = self.products.has(&p.id);
                if cached {
                    report.skipped += 1;
                }
                !cached
            })
            .collect();
        // duplicates count once
        report.total = seen.len();

        if pending.is_empty() {
            log::debug!("all {} catalog vectors already cached", report.total);
            return report;
        }

        let batch_count = pending.len().div_ceil(self.batch_size);
        log::info!(
            "pre-computing {} catalog vectors in {batch_count} batches of up to {}",
            pending.len(),
            self.batch_size
        );

        for (index, batch) in pending.chunks(self.batch_size).enumerate() {
            if index > 0 && !self.pacing_delay.is_zero() {
                tokio::time::sleep(self.pacing_delay).await;
            }

            self.run_batch(batch, &mut report).await;
            report.batches += 1;

            log::info!(
                "batch {}/{batch_count} done: {} cached, {} failed so far",
                index + 1,
                report.skipped + report.succeeded,
                report.failed.len()
            );
        }

        debug_assert!(report.is_complete());
        if report.failed.is_empty() {
            log::info!("catalog pre-computation finished: {} vectors", report.succeeded);
        } else {
            log::warn!(
                "catalog pre-computation finished: {} vectors, {} products failed",
                report.succeeded,
                report.failed.len()
            );
        }

        report
    }

    async fn run_batch(&self, batch: &[&Product], report: &mut FillReport) {
        let mut tasks = JoinSet::new();
        for product in batch {
            let extractor = self.extractor.clone();
            let id = product.id;
            let image_url = product.image_url.clone();
            tasks.spawn(async move { (id, extractor.extract(&image_url).await) });
        }

        let mut unresolved: HashSet<u64> = batch.iter().map(|p| p.id).collect();
        while let Some(joined) = tasks.join_next().await {
            let (id, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    log::error!("catalog extraction task failed: {err}");
                    continue;
                }
            };
            unresolved.remove(&id);

            match result {
                Ok(embedding) => {
                    self.products.put(id, embedding);
                    report.succeeded += 1;
                }
                Err(err) => {
                    log::warn!("failed to compute vector for product {id}: {err}");
                    report.failed.insert(id, err.to_string());
                }
            }
        }

        for id in unresolved {
            report
                .failed
                .insert(id, "extraction task aborted".to_string());
        }
    }
}
