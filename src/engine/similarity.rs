//! Scoring and ranking.
//!
//! Scores live in [0, 1]: cosine similarity is remapped with `(cos + 1) / 2`.
//! Ranking groups near-equal scores into bands and orders each band by
//! category priority, then price.

use std::cmp::Ordering;

use serde::Serialize;

use crate::catalog::{Category, Product};
use crate::engine::errors::MatchError;

/// Scores within this distance of a band's leading score share the band.
pub const TIE_BAND: f32 = 0.05;

/// Absorbs f32 rounding so a gap of exactly `TIE_BAND` still ties.
const TIE_EPSILON: f32 = 1e-6;

/// A catalog item scored against one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    #[serde(flatten)]
    pub product: Product,
    pub similarity: f32,
}

/// Cosine similarity remapped to [0, 1].
///
/// Indices where either side is NaN or infinite are skipped. A zero norm
/// (including empty vectors) scores 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, MatchError> {
    if a.len() != b.len() {
        return Err(MatchError::VectorLengthMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }

    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (&x, &y) in a.iter().zip(b) {
        if !x.is_finite() || !y.is_finite() {
            continue;
        }
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    Ok((((cosine + 1.0) / 2.0).clamp(0.0, 1.0)) as f32)
}

/// Additive boost per category.
pub fn category_boost(category: &Category) -> f32 {
    match category {
        Category::Footwear => 0.12,
        Category::Clothing => 0.10,
        Category::Accessories => 0.08,
        Category::Electronics => 0.05,
        Category::Other(_) => 0.0,
    }
}

/// Tie-break priority; lower ranks first.
pub fn category_rank(category: &Category) -> u8 {
    match category {
        Category::Footwear => 0,
        Category::Clothing => 1,
        Category::Accessories => 2,
        Category::Electronics => 3,
        Category::Other(_) => 4,
    }
}

/// Cosine similarity plus the category boost, capped at 1.
pub fn enhanced_similarity(a: &[f32], b: &[f32], category: &Category) -> Result<f32, MatchError> {
    let base = cosine_similarity(a, b)?;
    Ok((base + category_boost(category)).min(1.0))
}

/// Sort key for one result. Lexicographic over band, category, price,
/// score and id, which makes it a strict total order.
#[derive(Debug, Clone, Copy)]
pub struct RankKey {
    pub band: usize,
    pub category: u8,
    pub price: f64,
    pub similarity: f32,
    pub id: u64,
}

impl RankKey {
    fn new(band: usize, result: &RankedResult) -> Self {
        Self {
            band,
            category: category_rank(&result.product.category),
            price: result.product.price_value(),
            similarity: result.similarity,
            id: result.product.id,
        }
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.band
            .cmp(&other.band)
            .then_with(|| self.category.cmp(&other.category))
            .then_with(|| self.price.total_cmp(&other.price))
            .then_with(|| other.similarity.total_cmp(&self.similarity))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RankKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankKey {}

/// Drop results below `min_similarity` and order the rest.
///
/// Results are walked from the highest score down; a result joins the current
/// band while it is within `TIE_BAND` of the band's first score, otherwise it
/// opens a new band. Inside a band, category priority and then ascending price
/// decide.
pub fn rank(results: Vec<RankedResult>, min_similarity: f32) -> Vec<RankedResult> {
    let mut kept: Vec<RankedResult> = results
        .into_iter()
        .filter(|r| r.similarity >= min_similarity)
        .collect();

    kept.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.product.id.cmp(&b.product.id))
    });

    let mut band = 0;
    let mut leader: Option<f32> = None;
    let mut keyed: Vec<(RankKey, RankedResult)> = Vec::with_capacity(kept.len());
    for result in kept {
        match leader {
            Some(top) if top - result.similarity <= TIE_BAND + TIE_EPSILON => {}
            Some(_) => {
                band += 1;
                leader = Some(result.similarity);
            }
            None => leader = Some(result.similarity),
        }
        keyed.push((RankKey::new(band, &result), result));
    }

    keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
    keyed.into_iter().map(|(_, result)| result).collect()
}
