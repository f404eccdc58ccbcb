//! Degraded-mode scoring for when no model is available.

use rand::Rng;

use crate::catalog::Product;
use crate::engine::similarity::RankedResult;

/// Hands out random scores in `[min_score, max_score]`. Results built from it
/// must be flagged as degraded: the scores say nothing about the image.
#[derive(Debug, Clone, Copy)]
pub struct FallbackProvider {
    min_score: f32,
    max_score: f32,
}

impl FallbackProvider {
    pub fn new(min_score: f32, max_score: f32) -> Self {
        let min_score = min_score.clamp(0.0, 1.0);
        let max_score = max_score.clamp(0.0, 1.0);
        Self {
            min_score: min_score.min(max_score),
            max_score: max_score.max(min_score),
        }
    }

    pub fn range(&self) -> (f32, f32) {
        (self.min_score, self.max_score)
    }

    /// Score every product and sort by score, highest first.
    pub fn score(&self, catalog: &[Product]) -> Vec<RankedResult> {
        let mut rng = rand::rng();
        let mut results: Vec<RankedResult> = catalog
            .iter()
            .map(|product| RankedResult {
                product: product.clone(),
                similarity: rng.random_range(self.min_score..=self.max_score),
            })
            .collect();

        results.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.product.id.cmp(&b.product.id))
        });
        results
    }
}

impl Default for FallbackProvider {
    fn default() -> Self {
        Self::new(0.5, 0.8)
    }
}
