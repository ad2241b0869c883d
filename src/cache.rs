// Lunar Compilation Cache
// LRU of compiled chunks keyed by (source text, compatibility version)

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use serde::Serialize;

use crate::profile::LuaVersion;

pub const DEFAULT_MAX_ENTRIES: usize = 64;

/// Where a previously compiled chunk lives in the script's instruction array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedChunk {
    pub entry: usize,
    pub source_id: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub capacity: usize,
}

struct Entry {
    /// Full text, so a hash collision is a miss instead of a wrong chunk
    source: Arc<str>,
    version: LuaVersion,
    chunk: CachedChunk,
}

struct CacheInner {
    lru: Option<LruCache<u64, Entry>>,
    stats: CacheStats,
}

/// Thread-safe LRU compilation cache
pub struct CompilationCache {
    inner: Mutex<CacheInner>,
}

impl CompilationCache {
    /// A zero capacity disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: NonZeroUsize::new(capacity).map(LruCache::new),
                stats: CacheStats {
                    capacity,
                    ..CacheStats::default()
                },
            }),
        }
    }

    pub fn key(source: &str, version: LuaVersion) -> u64 {
        let mut hasher = FxHasher::default();
        source.hash(&mut hasher);
        version.resolve().hash(&mut hasher);
        hasher.finish()
    }

    pub fn try_get(&self, source: &str, version: LuaVersion) -> Option<CachedChunk> {
        let key = Self::key(source, version);
        let mut inner = self.inner.lock();
        let found = inner.lru.as_mut().and_then(|lru| {
            lru.get(&key)
                .filter(|e| e.version == version.resolve() && &*e.source == source)
                .map(|e| e.chunk)
        });
        match found {
            Some(chunk) => {
                inner.stats.hits += 1;
                log::debug!("compilation cache hit (entry {})", chunk.entry);
            }
            None => {
                inner.stats.misses += 1;
                log::trace!("compilation cache miss");
            }
        }
        found
    }

    pub fn store(&self, source: &str, version: LuaVersion, chunk: CachedChunk) {
        let key = Self::key(source, version);
        let mut inner = self.inner.lock();
        let Some(lru) = inner.lru.as_mut() else {
            return;
        };
        let evicted = lru.push(
            key,
            Entry {
                source: Arc::from(source),
                version: version.resolve(),
                chunk,
            },
        );
        if matches!(evicted, Some((old_key, _)) if old_key != key) {
            inner.stats.evictions += 1;
            log::debug!("compilation cache evicted a chunk");
        }
    }

    pub fn clear(&self) {
        if let Some(lru) = self.inner.lock().lru.as_mut() {
            lru.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.as_ref().map_or(0, |lru| lru.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.lru.as_ref().map_or(0, |lru| lru.len()),
            ..inner.stats
        }
    }
}

impl Default for CompilationCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(entry: usize) -> CachedChunk {
        CachedChunk { entry, source_id: 1 }
    }

    #[test]
    fn hits_are_keyed_by_source_and_version() {
        let cache = CompilationCache::new(4);
        cache.store("return 1", LuaVersion::Lua54, chunk(10));
        assert_eq!(cache.try_get("return 1", LuaVersion::Lua54), Some(chunk(10)));
        assert_eq!(cache.try_get("return 1", LuaVersion::Latest), Some(chunk(10)));
        assert_eq!(cache.try_get("return 1", LuaVersion::Lua53), None);
        assert_eq!(cache.try_get("return 2", LuaVersion::Lua54), None);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (2, 2));
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let cache = CompilationCache::new(2);
        cache.store("a", LuaVersion::Lua54, chunk(1));
        cache.store("b", LuaVersion::Lua54, chunk(2));
        cache.try_get("a", LuaVersion::Lua54);
        cache.store("c", LuaVersion::Lua54, chunk(3));
        assert!(cache.try_get("b", LuaVersion::Lua54).is_none());
        assert!(cache.try_get("a", LuaVersion::Lua54).is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = CompilationCache::new(0);
        cache.store("a", LuaVersion::Lua54, chunk(1));
        assert!(cache.try_get("a", LuaVersion::Lua54).is_none());
        assert!(cache.is_empty());
    }
}
