//! Embedding-based visual similarity engine.
//!
//! # Architecture
//!
//! - `backend`: model capability traits and the fastembed implementation
//! - `model`: model lifecycle with fallback configurations and single-flight loading
//! - `cache`: image-keyed and product-keyed embedding stores
//! - `source`: image reference parsing and HTTP fetching
//! - `extractor`: cached, retrying single-image extraction
//! - `similarity`: cosine scoring, category boosts and ranking
//! - `batch`: paced, concurrent catalog pre-computation
//! - `fallback`: random scores for degraded mode
//! - `service`: the engine context tying everything together

pub mod backend;
pub mod batch;
pub mod cache;
pub mod errors;
pub mod extractor;
pub mod fallback;
pub mod model;
pub mod service;
pub mod similarity;
pub mod source;

pub use batch::FillReport;
pub use errors::MatchError;
pub use service::{EngineStatus, MatchEngine, MatchOutcome, SelfTestReport};
pub use similarity::RankedResult;
