//! Process-wide dependency output cache
//!
//! Each producer's outputs are computed at most once per process, regardless
//! of how many consumers reference them or whether concurrent consumers race.
//! The cache is process-wide by design: multiple scheduler invocations within
//! one process share it. Entries are immutable once written; only tests may
//! [`clear`](OutputCache::clear) it.

use crate::{
    error::{Result, RunError},
    value::OutputMap,
};
use once_cell::sync::{Lazy, OnceCell};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Outcome of computing a producer's outputs.
#[derive(Clone, Debug)]
pub enum CachedOutputs {
    /// The producer has applied state and these are its outputs.
    Applied(Arc<OutputMap>),
    /// The producer has no applied state. Cached like any other result so
    /// consumers that fall back to mocks do not re-invoke the producer.
    NotApplied,
}

impl CachedOutputs {
    pub fn applied(outputs: OutputMap) -> Self {
        CachedOutputs::Applied(Arc::new(outputs))
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, CachedOutputs::Applied(_))
    }
}

type Slot = Arc<OnceCell<std::result::Result<CachedOutputs, String>>>;

/// Memoized single-flight store of producer outputs, keyed by canonical
/// producer path.
#[derive(Default)]
pub struct OutputCache {
    slots: Mutex<HashMap<PathBuf, Slot>>,
}

static GLOBAL: Lazy<OutputCache> = Lazy::new(OutputCache::default);

impl OutputCache {
    /// The process-wide cache instance.
    pub fn global() -> &'static OutputCache {
        &GLOBAL
    }

    /// Returns the memoized outputs for `producer`, computing them with
    /// `compute` on first access.
    ///
    /// The first caller becomes the computer; concurrent callers for the same
    /// producer block on the same slot and observe the same result. Errors
    /// are cached too: a failing producer is not retried within the process.
    pub fn get_or_compute(
        &self,
        producer: &Path,
        compute: impl FnOnce() -> Result<CachedOutputs>,
    ) -> Result<CachedOutputs> {
        let slot = self.slot(producer);
        let result = slot.get_or_init(|| {
            trace!(producer = %producer.display(), "computing dependency outputs");
            compute().map_err(|err| err.to_string())
        });
        match result {
            Ok(outputs) => Ok(outputs.clone()),
            Err(message) => Err(RunError::msg(format!(
                "reading outputs of {}: {message}",
                producer.display()
            ))),
        }
    }

    /// Returns the cached outputs without computing, if present.
    pub fn peek(&self, producer: &Path) -> Option<CachedOutputs> {
        let slots = self.slots.lock().expect("output cache poisoned");
        slots.get(producer).and_then(|slot| slot.get()).and_then(|r| r.as_ref().ok()).cloned()
    }

    /// Publishes freshly computed outputs for `producer` if no consumer has
    /// asked for them yet. A no-op on an already populated slot.
    pub fn seed(&self, producer: &Path, outputs: CachedOutputs) {
        let slot = self.slot(producer);
        let _ = slot.set(Ok(outputs));
    }

    /// Drops every entry. Tests only; production code treats the cache as
    /// append-only for the life of the process.
    pub fn clear(&self) {
        self.slots.lock().expect("output cache poisoned").clear();
    }

    fn slot(&self, producer: &Path) -> Slot {
        let mut slots = self.slots.lock().expect("output cache poisoned");
        slots.entry(producer.to_path_buf()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn outputs(v: &str) -> CachedOutputs {
        let mut map = OutputMap::new();
        map.insert("id".to_string(), Value::String(v.to_string()));
        CachedOutputs::applied(map)
    }

    #[test]
    fn computes_once_per_producer() {
        let cache = OutputCache::default();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let got = cache
                .get_or_compute(Path::new("/ws/vpc"), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(outputs("vpc-1"))
                })
                .unwrap();
            assert!(got.is_applied());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_consumers_share_one_flight() {
        let cache = Arc::new(OutputCache::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(std::thread::spawn(move || {
                cache
                    .get_or_compute(Path::new("/ws/vpc"), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        Ok(outputs("vpc-1"))
                    })
                    .unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.join().unwrap().is_applied());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn not_applied_is_cached() {
        let cache = OutputCache::default();
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let got = cache
                .get_or_compute(Path::new("/ws/new"), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CachedOutputs::NotApplied)
                })
                .unwrap();
            assert!(!got.is_applied());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn seed_then_get_skips_compute() {
        let cache = OutputCache::default();
        cache.seed(Path::new("/ws/vpc"), outputs("vpc-1"));
        let got = cache
            .get_or_compute(Path::new("/ws/vpc"), || panic!("must not compute"))
            .unwrap();
        assert!(got.is_applied());
    }

    #[test]
    fn clear_resets_slots() {
        let cache = OutputCache::default();
        cache.seed(Path::new("/ws/vpc"), outputs("vpc-1"));
        cache.clear();
        assert!(cache.peek(Path::new("/ws/vpc")).is_none());
    }
}
