//! Resolution coalescing (singleflight pattern).
//!
//! When sibling requirements name the same package, only the first request
//! reaches the package source. Requests arriving while it is in flight block
//! until it finishes and share its result.

use crate::reference::Reference;
use crate::source::{SourceError, SourcePackage};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type Resolution = Result<Arc<SourcePackage>, SourceError>;

enum Slot {
    /// A request for this name is running.
    InFlight,
    /// The first request finished; `reference` is what it asked for.
    Done {
        reference: String,
        result: Resolution,
    },
}

/// A per-invocation cache of package resolutions, keyed by package name.
#[derive(Default)]
pub struct ResolutionCache {
    slots: Mutex<HashMap<String, Slot>>,
    ready: Condvar,
    coalesced: AtomicU64,
}

impl ResolutionCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `reference`, reusing the result of an earlier or in-flight
    /// request for the same package name.
    ///
    /// A cached package that does not satisfy `reference`, or a cached
    /// failure for a different reference, is not reused: `fetch` runs again
    /// and its result is returned without replacing the cached one.
    pub fn resolve<F>(&self, reference: &Reference, fetch: F) -> Resolution
    where
        F: FnOnce() -> Result<SourcePackage, SourceError>,
    {
        let name = reference.name.as_str();
        let text = reference.to_string();

        let mut slots = self.slots.lock();
        loop {
            match slots.get(name) {
                Some(Slot::InFlight) => self.ready.wait(&mut slots),
                Some(Slot::Done { reference: cached, result }) => {
                    let reusable = match result {
                        Ok(package) => reference.is_satisfied_by(&package.identity),
                        Err(_) => *cached == text,
                    };
                    if reusable {
                        self.coalesced.fetch_add(1, Ordering::Relaxed);
                        debug!("Reusing resolution of {} for {}", cached, text);
                        return result.clone();
                    }
                    drop(slots);
                    return fetch().map(Arc::new);
                }
                None => break,
            }
        }

        slots.insert(name.to_string(), Slot::InFlight);
        drop(slots);

        let guard = InFlightGuard {
            cache: self,
            name,
            armed: true,
        };
        let result = fetch().map(Arc::new);
        guard.complete(text, result.clone());
        result
    }

    /// Number of requests answered from the cache.
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

/// Releases an in-flight slot even if the fetch panics, so waiters never
/// block forever.
struct InFlightGuard<'a> {
    cache: &'a ResolutionCache,
    name: &'a str,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn complete(mut self, reference: String, result: Resolution) {
        self.cache
            .slots
            .lock()
            .insert(self.name.to_string(), Slot::Done { reference, result });
        self.armed = false;
        self.cache.ready.notify_all();
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.slots.lock().remove(self.name);
            self.cache.ready.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{OptionOverrides, OptionSchema};
    use crate::reference::PackageIdentity;
    use rayon::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn package(name: &str, version: &str) -> SourcePackage {
        SourcePackage {
            identity: PackageIdentity::new(name, version),
            settings: Vec::new(),
            option_schema: OptionSchema::new(),
            requirements: Vec::new(),
            dependency_options: OptionOverrides::new(),
            output: None,
        }
    }

    #[test]
    fn concurrent_requests_fetch_once() {
        let cache = ResolutionCache::new();
        let calls = AtomicUsize::new(0);
        let reference = Reference::parse("glad/0.1.34").unwrap();

        let results: Vec<_> = (0..8)
            .into_par_iter()
            .map(|_| {
                cache.resolve(&reference, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    Ok(package("glad", "0.1.34"))
                })
            })
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap().identity.version == "0.1.34"));
        assert_eq!(cache.coalesced_count(), 7);
    }

    #[test]
    fn unsatisfying_cache_entry_is_bypassed() {
        let cache = ResolutionCache::new();
        let v1 = Reference::parse("fmt/[^1.0]").unwrap();
        let v2 = Reference::parse("fmt/[^2.0]").unwrap();

        cache.resolve(&v1, || Ok(package("fmt", "1.4.0"))).unwrap();
        let second = cache.resolve(&v2, || Ok(package("fmt", "2.1.0"))).unwrap();
        assert_eq!(second.identity.version, "2.1.0");

        // The first result stays cached
        let again = cache
            .resolve(&v1, || panic!("should be served from the cache"))
            .unwrap();
        assert_eq!(again.identity.version, "1.4.0");
    }

    #[test]
    fn failures_are_shared_only_for_the_same_reference() {
        let cache = ResolutionCache::new();
        let missing = Reference::parse("imgui/1.74").unwrap();
        let err = SourceError::NotFound {
            reference: "imgui/1.74".to_string(),
        };

        assert!(cache.resolve(&missing, || Err(err.clone())).is_err());
        assert_eq!(
            cache.resolve(&missing, || Ok(package("imgui", "1.74"))).unwrap_err(),
            err
        );

        let other = Reference::parse("imgui/1.75").unwrap();
        assert!(cache.resolve(&other, || Ok(package("imgui", "1.75"))).is_ok());
    }

    #[test]
    fn panicking_fetch_releases_slot() {
        let cache = ResolutionCache::new();
        let reference = Reference::parse("glad/0.1.34").unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.resolve(&reference, || panic!("source crashed"))
        }));
        assert!(outcome.is_err());

        let retried = cache.resolve(&reference, || Ok(package("glad", "0.1.34")));
        assert!(retried.is_ok());
    }
}
