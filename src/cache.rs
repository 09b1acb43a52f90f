use std::{
    cell::RefCell,
    collections::HashMap,
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    data::{domain::IndexCode, observation::RawObservation},
    error::{EngineResult, IoError},
    store::ObservationSource,
};

// ================================================================================================
// Cache Key
// ================================================================================================

/// Identity of a cached query: the function name plus a hash of its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    function: String,
    args_hash: String,
}

impl CacheKey {
    /// Hashes the postcard encoding of `args` with blake3.
    pub fn new<A: Serialize + ?Sized>(function: &str, args: &A) -> EngineResult<Self> {
        let mut hasher = blake3::Hasher::new();
        let bytes = postcard::to_stdvec(args).map_err(IoError::Encoding)?;
        hasher.update(&bytes);
        Ok(Self {
            function: function.to_string(),
            args_hash: format!("{}", hasher.finalize()),
        })
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args_hash(&self) -> &str {
        &self.args_hash
    }

    fn file_name(&self) -> String {
        format!("{}-{}.postcard", self.function, self.args_hash)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    stored_at_ms: i64,
    payload: Vec<u8>,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.timestamp_millis() - self.stored_at_ms < ttl.num_milliseconds()
    }
}

// ================================================================================================
// Query Cache
// ================================================================================================

/// Explicit query-result cache with a fixed TTL.
///
/// Entries live in memory and, when a directory is configured, are also persisted as one
/// postcard file per key so later runs can reuse them until they expire.
#[derive(Debug)]
pub struct QueryCache {
    ttl: Duration,
    dir: Option<PathBuf>,
    entries: RefCell<HashMap<CacheKey, CacheEntry>>,
}

impl QueryCache {
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            ttl,
            dir: None,
            entries: RefCell::new(HashMap::new()),
        }
    }

    pub fn persistent(ttl: Duration, dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                IoError::FileSystem(format!(
                    "Failed to create cache directory {}: {e}",
                    dir.display()
                ))
            })?;
        }
        Ok(Self {
            ttl,
            dir: Some(dir),
            entries: RefCell::new(HashMap::new()),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> EngineResult<Option<T>> {
        self.get_at(key, Utc::now())
    }

    pub fn put<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) -> EngineResult<()> {
        self.put_at(key, value, Utc::now())
    }

    /// Returns the cached value or computes, stores and returns it.
    pub fn get_or_insert_with<T, F>(&self, key: &CacheKey, compute: F) -> EngineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> EngineResult<T>,
    {
        if let Some(hit) = self.get(key)? {
            debug!(function = key.function(), "Cache hit");
            return Ok(hit);
        }
        debug!(function = key.function(), "Cache miss");
        let value = compute()?;
        self.put(key, &value)?;
        Ok(value)
    }

    pub fn invalidate(&self, key: &CacheKey) -> EngineResult<()> {
        self.entries.borrow_mut().remove(key);
        if let Some(path) = self.file_path(key) {
            remove_if_exists(&path)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> EngineResult<()> {
        let keys: Vec<CacheKey> = self.entries.borrow_mut().drain().map(|(k, _)| k).collect();
        if self.dir.is_some() {
            for key in &keys {
                if let Some(path) = self.file_path(key) {
                    remove_if_exists(&path)?;
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub(crate) fn get_at<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<T>> {
        let entry = match self.entries.borrow().get(key).cloned() {
            Some(entry) => Some(entry),
            None => self.read_file(key)?,
        };

        let Some(entry) = entry else {
            return Ok(None);
        };
        if !entry.is_fresh(now, self.ttl) {
            debug!(function = key.function(), "Cache entry expired");
            self.invalidate(key)?;
            return Ok(None);
        }

        let value = postcard::from_bytes(&entry.payload).map_err(IoError::Encoding)?;
        self.entries.borrow_mut().insert(key.clone(), entry);
        Ok(Some(value))
    }

    pub(crate) fn put_at<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let entry = CacheEntry {
            stored_at_ms: now.timestamp_millis(),
            payload: postcard::to_stdvec(value).map_err(IoError::Encoding)?,
        };
        if let Some(path) = self.file_path(key) {
            write_entry(&path, &entry)?;
        }
        self.entries.borrow_mut().insert(key.clone(), entry);
        Ok(())
    }

    fn file_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(key.file_name()))
    }

    fn read_file(&self, key: &CacheKey) -> EngineResult<Option<CacheEntry>> {
        let Some(path) = self.file_path(key) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(IoError::Io)?;
        match postcard::from_bytes::<CacheEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable cache file");
                remove_if_exists(&path)?;
                Ok(None)
            }
        }
    }
}

fn write_entry(path: &Path, entry: &CacheEntry) -> EngineResult<()> {
    let file = fs::File::create(path).map_err(IoError::Io)?;
    let mut writer = BufWriter::new(file);
    postcard::to_io(entry, &mut writer)
        .map_err(|e| IoError::WriteFailed(e.to_string()))?;
    writer.flush().map_err(IoError::Io)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> EngineResult<()> {
    if path.exists() {
        fs::remove_file(path).map_err(IoError::Io)?;
    }
    Ok(())
}

// ================================================================================================
// Cached Source
// ================================================================================================

/// [`ObservationSource`] decorator that answers repeated queries from a [`QueryCache`].
#[derive(Debug)]
pub struct CachedSource<'c, S> {
    inner: S,
    cache: &'c QueryCache,
}

impl<'c, S> CachedSource<'c, S> {
    pub fn new(inner: S, cache: &'c QueryCache) -> Self {
        Self { inner, cache }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ObservationSource> ObservationSource for CachedSource<'_, S> {
    fn valuations(&self, since: NaiveDate) -> EngineResult<Vec<RawObservation>> {
        let key = CacheKey::new("valuations", &since)?;
        self.cache
            .get_or_insert_with(&key, || self.inner.valuations(since))
    }

    fn positions(&self) -> EngineResult<Vec<RawObservation>> {
        let key = CacheKey::new("positions", &())?;
        self.cache.get_or_insert_with(&key, || self.inner.positions())
    }

    fn index_levels(
        &self,
        code: &IndexCode,
        since: NaiveDate,
    ) -> EngineResult<Vec<RawObservation>> {
        let key = CacheKey::new("index_levels", &(code, since))?;
        self.cache
            .get_or_insert_with(&key, || self.inner.index_levels(code, since))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn key_depends_on_function_and_arguments() {
        let a = CacheKey::new("valuations", &"2014-06-01").expect("key");
        let b = CacheKey::new("valuations", &"2014-06-01").expect("key");
        let c = CacheKey::new("valuations", &"2015-01-01").expect("key");
        let d = CacheKey::new("positions", &"2014-06-01").expect("key");

        assert_eq!(a, b);
        assert_ne!(a.args_hash(), c.args_hash());
        assert_ne!(a, d);
        assert_eq!(a.args_hash(), d.args_hash());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = QueryCache::in_memory(Duration::seconds(60));
        let key = CacheKey::new("f", &1u32).expect("key");
        let t0 = Utc::now();

        cache.put_at(&key, &vec![1.0f64, 2.0], t0).expect("put");
        let hit: Option<Vec<f64>> = cache.get_at(&key, t0 + Duration::seconds(59)).expect("get");
        assert_eq!(hit, Some(vec![1.0, 2.0]));

        let miss: Option<Vec<f64>> = cache.get_at(&key, t0 + Duration::seconds(60)).expect("get");
        assert_eq!(miss, None);
        assert!(cache.is_empty(), "expired entries are evicted");
    }

    #[test]
    fn get_or_insert_computes_once() {
        let cache = QueryCache::in_memory(Duration::hours(1));
        let key = CacheKey::new("f", &"x").expect("key");
        let calls = Cell::new(0);

        for _ in 0..3 {
            let v: String = cache
                .get_or_insert_with(&key, || {
                    calls.set(calls.get() + 1);
                    Ok("value".to_string())
                })
                .expect("value");
            assert_eq!(v, "value");
        }
        assert_eq!(calls.get(), 1);

        cache.invalidate(&key).expect("invalidate");
        let _: String = cache
            .get_or_insert_with(&key, || {
                calls.set(calls.get() + 1);
                Ok("value".to_string())
            })
            .expect("value");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn persisted_entries_survive_a_new_cache_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = CacheKey::new("f", &42u64).expect("key");

        let first = QueryCache::persistent(Duration::hours(1), dir.path()).expect("cache");
        first.put(&key, &vec!["a".to_string()]).expect("put");

        let second = QueryCache::persistent(Duration::hours(1), dir.path()).expect("cache");
        let hit: Option<Vec<String>> = second.get(&key).expect("get");
        assert_eq!(hit, Some(vec!["a".to_string()]));

        second.clear().expect("clear");
        let third = QueryCache::persistent(Duration::hours(1), dir.path()).expect("cache");
        let miss: Option<Vec<String>> = third.get(&key).expect("get");
        assert_eq!(miss, None);
    }
}
