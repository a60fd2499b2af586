//! Hierarchical repository keyed by match pattern.
//!
//! Lookups merge every pattern matching an address, most specific first, so a
//! field set by a general pattern (`#`) shows through a specific one that
//! leaves it unset. The pattern table is an immutable snapshot swapped on each
//! mutation:
//! - readers load the current snapshot without taking the writer lock
//! - mutations serialize on a single writer mutex and publish a new version
//! - resolved records are cached per address in a bounded LRU tagged with the
//!   snapshot version, and the cache is cleared on every mutation

use crate::settings::wildcard::Pattern;
use crate::settings::ConfigError;
use arc_swap::ArcSwap;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Records stored in a [`HierarchicalRepository`].
pub trait Mergeable: Clone + Send + Sync + 'static {
    /// Fill whatever `self` leaves unset from a less specific match.
    fn merge(&mut self, less_specific: &Self);
}

struct MatchEntry<T> {
    pattern: Pattern,
    value: T,
}

struct MatchTable<T> {
    version: u64,
    /// Sorted most specific first.
    entries: Vec<MatchEntry<T>>,
    default: T,
}

impl<T: Mergeable> MatchTable<T> {
    fn resolve(&self, address: &str) -> T {
        let mut merged: Option<T> = None;
        for entry in self.entries.iter().filter(|e| e.pattern.matches(address)) {
            match merged.as_mut() {
                Some(acc) => acc.merge(&entry.value),
                None => merged = Some(entry.value.clone()),
            }
        }
        match merged {
            Some(mut acc) => {
                acc.merge(&self.default);
                acc
            }
            None => self.default.clone(),
        }
    }

    fn next(&self, entries: Vec<MatchEntry<T>>, default: T) -> Self {
        Self {
            version: self.version + 1,
            entries,
            default,
        }
    }

    fn cloned_entries(&self) -> Vec<MatchEntry<T>> {
        self.entries
            .iter()
            .map(|e| MatchEntry {
                pattern: e.pattern.clone(),
                value: e.value.clone(),
            })
            .collect()
    }
}

/// Snapshot of cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub hits: u64,
    pub misses: u64,
    pub version: u64,
    pub patterns: usize,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
}

pub struct HierarchicalRepository<T: Mergeable> {
    table: ArcSwap<MatchTable<T>>,
    writer: Mutex<()>,
    cache: Mutex<LruCache<String, (u64, Arc<T>)>>,
    counters: Mutex<Counters>,
}

impl<T: Mergeable> HierarchicalRepository<T> {
    pub fn new(default: T) -> Self {
        Self::with_cache_capacity(default, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(default: T, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            table: ArcSwap::from_pointee(MatchTable {
                version: 0,
                entries: Vec::new(),
                default,
            }),
            writer: Mutex::new(()),
            cache: Mutex::new(LruCache::new(capacity)),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Insert or replace the record for `pattern`.
    pub fn add_match(&self, pattern: &str, value: T) -> Result<(), ConfigError> {
        let pattern = Pattern::parse(pattern)?;
        self.mutate(|current| {
            let mut entries = current.cloned_entries();
            entries.retain(|e| e.pattern != pattern);
            entries.push(MatchEntry {
                pattern: pattern.clone(),
                value,
            });
            entries.sort_by(|a, b| b.pattern.compare_specificity(&a.pattern));
            Some(current.next(entries, current.default.clone()))
        });
        debug!(pattern = %pattern, "address match added");
        Ok(())
    }

    /// Remove the record for `pattern`. Returns whether it existed.
    pub fn remove_match(&self, pattern: &str) -> bool {
        let mut removed = false;
        self.mutate(|current| {
            if !current.entries.iter().any(|e| e.pattern.as_str() == pattern) {
                return None;
            }
            removed = true;
            let mut entries = current.cloned_entries();
            entries.retain(|e| e.pattern.as_str() != pattern);
            Some(current.next(entries, current.default.clone()))
        });
        if removed {
            debug!(pattern, "address match removed");
        }
        removed
    }

    /// Replace the fallback record returned when nothing matches.
    pub fn set_default(&self, value: T) {
        self.mutate(|current| Some(current.next(current.cloned_entries(), value)));
    }

    /// Drop every pattern, keeping the default.
    pub fn clear(&self) {
        self.mutate(|current| Some(current.next(Vec::new(), current.default.clone())));
    }

    /// Resolve the merged record for a concrete address.
    pub fn get_match(&self, address: &str) -> Arc<T> {
        let table = self.table.load_full();
        if let Some((version, hit)) = self.cache.lock().get(address) {
            if *version == table.version {
                self.counters.lock().hits += 1;
                return hit.clone();
            }
        }
        self.counters.lock().misses += 1;
        let merged = Arc::new(table.resolve(address));
        let mut cache = self.cache.lock();
        // A mutation between the load and here must not leave a stale entry.
        if self.table.load().version == table.version {
            cache.put(address.to_string(), (table.version, merged.clone()));
        }
        merged
    }

    pub fn default_value(&self) -> T {
        self.table.load().default.clone()
    }

    /// Patterns currently stored, most specific first.
    pub fn patterns(&self) -> Vec<String> {
        self.table
            .load()
            .entries
            .iter()
            .map(|e| e.pattern.as_str().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RepositoryStats {
        let table = self.table.load();
        let counters = self.counters.lock();
        RepositoryStats {
            hits: counters.hits,
            misses: counters.misses,
            version: table.version,
            patterns: table.entries.len(),
        }
    }

    fn mutate<F>(&self, build: F)
    where
        F: FnOnce(&MatchTable<T>) -> Option<MatchTable<T>>,
    {
        let _writer = self.writer.lock();
        let current = self.table.load_full();
        if let Some(next) = build(&current) {
            self.table.store(Arc::new(next));
            self.cache.lock().clear();
        }
    }
}
