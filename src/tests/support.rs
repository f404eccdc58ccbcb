//! In-memory stand-ins for the model loader, the model and the network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use url::Url;

use crate::engine::backend::{ModelBackend, ModelLoader};
use crate::engine::errors::BackendError;

pub const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// PNG-looking payload that carries `label`; `FakeBackend` keys vectors by it.
pub fn png_bytes(label: &str) -> Vec<u8> {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.extend_from_slice(label.as_bytes());
    bytes
}

pub fn data_uri(label: &str) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(png_bytes(label)))
}

fn bump(counter: &Mutex<HashMap<String, usize>>, key: &str) {
    *counter.lock().unwrap().entry(key.to_string()).or_default() += 1;
}

fn count(counter: &Mutex<HashMap<String, usize>>, key: &str) -> usize {
    counter.lock().unwrap().get(key).copied().unwrap_or_default()
}

fn total(counter: &Mutex<HashMap<String, usize>>) -> usize {
    counter.lock().unwrap().values().sum()
}

/// Take one pending failure for `key`, if any are left.
fn take_failure(failures: &Mutex<HashMap<String, usize>>, key: &str) -> bool {
    let mut failures = failures.lock().unwrap();
    match failures.get_mut(key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub enum LoaderScript {
    Succeed,
    Fail(&'static str),
    /// Blocks the loading thread before succeeding.
    SucceedAfter(Duration),
}

pub struct FakeLoader {
    scripts: Vec<(String, LoaderScript)>,
    calls: Mutex<HashMap<String, usize>>,
    backend: Arc<FakeBackend>,
}

impl FakeLoader {
    pub fn new(scripts: Vec<(&str, LoaderScript)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(name, script)| (name.to_string(), script))
                .collect(),
            calls: Mutex::new(HashMap::new()),
            backend: Arc::new(FakeBackend::new(4)),
        }
    }

    /// Every successful load hands out a view of `backend`.
    pub fn with_backend(mut self, backend: Arc<FakeBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn configurations(&self) -> Vec<String> {
        self.scripts.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn calls(&self, name: &str) -> usize {
        count(&self.calls, name)
    }

    pub fn total_calls(&self) -> usize {
        total(&self.calls)
    }
}

impl ModelLoader for FakeLoader {
    fn load(&self, configuration: &str) -> Result<Arc<dyn ModelBackend>, BackendError> {
        bump(&self.calls, configuration);

        let script = self
            .scripts
            .iter()
            .find(|(name, _)| name == configuration)
            .map(|(_, script)| script.clone())
            .ok_or_else(|| BackendError::other(format!("unknown configuration {configuration}")))?;

        match script {
            LoaderScript::Succeed => {}
            LoaderScript::Fail(message) => return Err(BackendError::new(message)),
            LoaderScript::SucceedAfter(delay) => std::thread::sleep(delay),
        }

        Ok(Arc::new(NamedBackend {
            name: configuration.to_string(),
            inner: self.backend.clone(),
        }))
    }
}

struct NamedBackend {
    name: String,
    inner: Arc<FakeBackend>,
}

impl ModelBackend for NamedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn extract(&self, image: &[u8]) -> Result<Vec<f32>, BackendError> {
        self.inner.extract(image)
    }
}

/// Deterministic model. Output is looked up by the label carried after the
/// PNG magic; unknown labels get a vector derived from the label bytes.
pub struct FakeBackend {
    dimensions: usize,
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    failures: Mutex<HashMap<String, usize>>,
    always_fail: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeBackend {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_vector(&self, label: &str, values: Vec<f32>) {
        self.vectors.lock().unwrap().insert(label.to_string(), values);
    }

    /// The next `times` extractions of `label` fail.
    pub fn fail_times(&self, label: &str, times: usize) {
        self.failures.lock().unwrap().insert(label.to_string(), times);
    }

    pub fn fail_always(&self, label: &str) {
        self.always_fail.lock().unwrap().insert(label.to_string());
    }

    pub fn calls(&self, label: &str) -> usize {
        count(&self.calls, label)
    }

    pub fn total_calls(&self) -> usize {
        total(&self.calls)
    }

    /// Most extractions that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn default_vector(&self, label: &str) -> Vec<f32> {
        let seed = label
            .bytes()
            .fold(17u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        (0..self.dimensions)
            .map(|i| ((seed.wrapping_add(i as u32 * 7919) % 97) as f32 + 1.0) / 97.0)
            .collect()
    }
}

impl ModelBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn extract(&self, image: &[u8]) -> Result<Vec<f32>, BackendError> {
        let label = String::from_utf8_lossy(image.strip_prefix(PNG_MAGIC).unwrap_or(image)).to_string();
        bump(&self.calls, &label);

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.always_fail.lock().unwrap().contains(&label) || take_failure(&self.failures, &label) {
            return Err(BackendError::other(format!("inference failed for {label}")));
        }

        let stored = self.vectors.lock().unwrap().get(&label).cloned();
        Ok(stored.unwrap_or_else(|| self.default_vector(&label)))
    }
}

/// Serves `png_bytes(url)` for every URL unless told otherwise.
pub struct FakeFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, usize>>,
    unreachable: Mutex<HashSet<String>>,
    probe_rejected: Mutex<HashSet<String>>,
    fetches: Mutex<HashMap<String, usize>>,
    probes: Mutex<HashMap<String, usize>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            bodies: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            probe_rejected: Mutex::new(HashSet::new()),
            fetches: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
        }
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn fail_times(&self, url: &str, times: usize) {
        self.failures.lock().unwrap().insert(url.to_string(), times);
    }

    pub fn fail_always(&self, url: &str) {
        self.unreachable.lock().unwrap().insert(url.to_string());
    }

    /// HEAD fails for `url` while GET still works.
    pub fn reject_probe(&self, url: &str) {
        self.probe_rejected.lock().unwrap().insert(url.to_string());
    }

    pub fn fetches(&self, url: &str) -> usize {
        count(&self.fetches, url)
    }

    pub fn total_fetches(&self) -> usize {
        total(&self.fetches)
    }

    pub fn probes(&self, url: &str) -> usize {
        count(&self.probes, url)
    }

    fn is_unreachable(&self, key: &str) -> bool {
        self.unreachable.lock().unwrap().contains(key)
    }
}

impl crate::engine::source::ImageFetcher for FakeFetcher {
    fn probe(&self, url: &Url) -> Result<(), BackendError> {
        let key = url.as_str();
        bump(&self.probes, key);
        if self.is_unreachable(key) {
            return Err(BackendError::network("HEAD failed: connection refused"));
        }
        if self.probe_rejected.lock().unwrap().contains(key) {
            return Err(BackendError::other("HEAD returned 405 Method Not Allowed"));
        }
        Ok(())
    }

    fn fetch(&self, url: &Url) -> Result<Vec<u8>, BackendError> {
        let key = url.as_str();
        bump(&self.fetches, key);

        if self.is_unreachable(key) || take_failure(&self.failures, key) {
            return Err(BackendError::network("connection refused"));
        }

        let body = self.bodies.lock().unwrap().get(key).cloned();
        Ok(body.unwrap_or_else(|| png_bytes(key)))
    }
}
