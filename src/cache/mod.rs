//! Clearance credential cache.
//!
//! Keeps the cookies + user-agent obtained from a solved challenge per origin
//! identity, expires them lazily, and mirrors every mutation to a JSON file so
//! a restart does not force a new solve.

mod persist;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use crate::solver::Clearance;

pub use persist::CacheIoError;

/// Clearance cookies live two hours unless configured otherwise.
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

const MIN_TTL: Duration = Duration::from_secs(1);

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| {
        let millis = duration.as_millis().min(i64::MAX as u128);
        chrono::Duration::milliseconds(millis as i64)
    })
}

/// Identity of a clearance record: origin host plus the proxy it was solved through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds the key from a `host[:port]` and an optional proxy URL.
    ///
    /// The proxy is hashed so credentials embedded in it never show up in
    /// cache statistics or on disk.
    pub fn new(host: &str, proxy: Option<&str>) -> Self {
        let host = host.trim().to_ascii_lowercase();
        match proxy.map(str::trim).filter(|p| !p.is_empty()) {
            None => Self(host),
            Some(proxy) => {
                let digest = Sha256::digest(proxy.as_bytes());
                let hex = format!("{digest:x}");
                Self(format!("{host}#{}", &hex[..16]))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_persisted(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cached clearance data for one origin identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearanceRecord {
    pub cookies: BTreeMap<String, String>,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ClearanceRecord {
    fn new(cookies: BTreeMap<String, String>, user_agent: String, ttl: Duration) -> Self {
        let created_at = Utc::now();
        Self {
            cookies,
            user_agent,
            created_at,
            expires_at: created_at + chrono_duration(ttl.max(MIN_TTL)),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn clearance(&self) -> Clearance {
        Clearance {
            cookies: self.cookies.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Point-in-time view of the cache contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub active: usize,
    pub total: usize,
    pub keys: Vec<CacheKey>,
}

#[derive(Debug, Error)]
pub enum CacheOpenError {
    #[error("cache path {0} is a directory")]
    IsDirectory(PathBuf),
}

struct CacheState {
    records: HashMap<CacheKey, ClearanceRecord>,
}

/// Thread-safe, optionally persisted credential cache.
///
/// A single mutex guards the map and the file write, so the on-disk copy is
/// always a snapshot of some in-memory state. No network call ever runs while
/// the lock is held.
#[derive(Clone)]
pub struct CredentialCache {
    inner: Arc<Mutex<CacheState>>,
    path: Option<Arc<PathBuf>>,
}

impl CredentialCache {
    /// Cache that lives in memory only.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheState {
                records: HashMap::new(),
            })),
            path: None,
        }
    }

    /// Opens (or starts) a cache persisted at `path`.
    ///
    /// Loading never fails because of file contents: unreadable files and bad
    /// entries are logged and skipped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheOpenError> {
        let path = path.as_ref().to_path_buf();
        if path.is_dir() {
            return Err(CacheOpenError::IsDirectory(path));
        }

        let records = persist::load(&path);
        if !records.is_empty() {
            log::info!("loaded {} cached clearance record(s) from {}", records.len(), path.display());
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(CacheState { records })),
            path: Some(Arc::new(path)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save(&self, state: &CacheState) {
        if let Some(path) = &self.path
            && let Err(err) = persist::save(path, &state.records)
        {
            log::error!("{err}; continuing with in-memory cache");
        }
    }

    /// Returns the record for `key` if it has not expired.
    pub fn get(&self, key: &CacheKey) -> Option<ClearanceRecord> {
        let mut state = self.lock();
        match state.records.get(key) {
            None => return None,
            Some(record) if !record.is_expired() => {
                log::debug!("using cached clearance for {key}");
                return Some(record.clone());
            }
            Some(_) => {}
        }

        log::info!("cached clearance for {key} expired, removing");
        state.records.remove(key);
        self.save(&state);
        None
    }

    /// Stores fresh clearance data for `key`, replacing any previous record.
    pub fn set(
        &self,
        key: &CacheKey,
        cookies: BTreeMap<String, String>,
        user_agent: impl Into<String>,
        ttl: Duration,
    ) -> ClearanceRecord {
        let record = ClearanceRecord::new(cookies, user_agent.into(), ttl);
        let mut state = self.lock();
        state.records.insert(key.clone(), record.clone());
        self.save(&state);
        log::info!("cached clearance for {key}, expires at {}", record.expires_at.to_rfc3339());
        record
    }

    /// Drops the record for `key`. Returns whether one was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut state = self.lock();
        if state.records.remove(key).is_some() {
            self.save(&state);
            log::info!("invalidated clearance for {key}");
            true
        } else {
            false
        }
    }

    /// Removes every record; returns how many were dropped.
    pub fn clear_all(&self) -> usize {
        let mut state = self.lock();
        let removed = state.records.len();
        state.records.clear();
        self.save(&state);
        log::info!("cleared all {removed} clearance record(s)");
        removed
    }

    /// Removes expired records; returns how many were dropped.
    pub fn clear_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.lock();
        let before = state.records.len();
        state.records.retain(|_, record| !record.is_expired_at(now));
        let removed = before - state.records.len();
        if removed > 0 {
            self.save(&state);
            log::info!("cleared {removed} expired clearance record(s)");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let state = self.lock();
        let active = state
            .records
            .values()
            .filter(|record| !record.is_expired_at(now))
            .count();
        let mut keys: Vec<CacheKey> = state.records.keys().cloned().collect();
        keys.sort();
        CacheStats {
            active,
            total: state.records.len(),
            keys,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn insert_record(&self, key: CacheKey, record: ClearanceRecord) {
        self.lock().records.insert(key, record);
    }
}

impl Default for CredentialCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("path", &self.path)
            .field("entries", &self.len())
            .finish()
    }
}
