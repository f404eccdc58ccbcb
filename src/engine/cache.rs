//! Process-lifetime embedding stores.
//!
//! Two instances exist per engine: one keyed by image reference, one keyed by
//! catalog product id. Entries never expire; they leave only through
//! `clear()` or an explicit `remove()`.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

/// Immutable feature vector shared between caches and callers.
///
/// Cloning is cheap and every clone points at the same values, so a cache hit
/// hands back bit-identical data.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Arc<[f32]>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values: values.into(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Number of NaN or infinite entries.
    pub fn non_finite_count(&self) -> usize {
        self.values.iter().filter(|v| !v.is_finite()).count()
    }

    pub fn same_allocation(&self, other: &Embedding) -> bool {
        Arc::ptr_eq(&self.values, &other.values)
    }
}

/// Key -> embedding store with insert/contains/clear.
pub struct EmbeddingCache<K> {
    name: &'static str,
    entries: RwLock<HashMap<K, Embedding>>,
}

/// Freshly analyzed images, keyed by URL or content hash.
pub type ImageCache = EmbeddingCache<String>;

/// Catalog items, keyed by product id.
pub type ProductCache = EmbeddingCache<u64>;

impl<K: Eq + Hash> EmbeddingCache<K> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Embedding>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Insert or overwrite the entry for `key`.
    pub fn put(&self, key: K, embedding: Embedding) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, embedding);
    }

    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<Embedding>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let dropped = entries.len();
        entries.clear();
        log::debug!("cleared {dropped} entries from {} cache", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let cache = ImageCache::new("image");
        cache.put("https://a/1.png".to_string(), Embedding::new(vec![1.0, 2.0]));

        let hit = cache.get("https://a/1.png").unwrap();
        assert_eq!(hit.as_slice(), &[1.0, 2.0]);
        assert!(cache.has("https://a/1.png"));
        assert!(!cache.has("https://a/2.png"));
        assert_eq!(cache.len(), 1);

        assert!(cache.remove("https://a/1.png").is_some());
        assert!(cache.remove("https://a/1.png").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_returns_same_allocation() {
        let cache = ProductCache::new("product");
        let embedding = Embedding::new(vec![0.5; 8]);
        cache.put(7, embedding.clone());

        let first = cache.get(&7).unwrap();
        let second = cache.get(&7).unwrap();
        assert!(first.same_allocation(&second));
        assert!(first.same_allocation(&embedding));
    }

    #[test]
    fn test_put_overwrites_existing_key() {
        let cache = ProductCache::new("product");
        cache.put(1, Embedding::new(vec![1.0]));
        cache.put(1, Embedding::new(vec![2.0]));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1).unwrap().as_slice(), &[2.0]);
    }

    #[test]
    fn test_clear_is_per_instance() {
        let images = ImageCache::new("image");
        let products = ProductCache::new("product");
        images.put("k".to_string(), Embedding::new(vec![1.0]));
        products.put(1, Embedding::new(vec![1.0]));

        images.clear();

        assert!(images.is_empty());
        assert_eq!(products.len(), 1);
    }

    #[test]
    fn test_non_finite_count() {
        let embedding = Embedding::new(vec![1.0, f32::NAN, f32::INFINITY, 0.0]);
        assert_eq!(embedding.non_finite_count(), 2);
        assert_eq!(embedding.dimensions(), 4);
    }
}
