//! Cache generations and the storage that holds them.
//!
//! A [`Cache`] is one generation: a named map from [`RequestKey`] to a stored
//! response snapshot. [`CacheStorage`] owns every generation the worker knows
//! about and enforces the optional byte quota across all of them.

use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use carniceria_net::{Request, Response, ResponseSource, ResponseType};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::ServiceWorkerError;

// ==================== Request Key ====================

/// Lookup key of a stored response: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for a GET of the given URL.
    pub fn get(url: &Url) -> Self {
        Self::new("GET", url)
    }

    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
        }
    }
}

impl From<&Request> for RequestKey {
    fn from(request: &Request) -> Self {
        Self::new(request.method.as_str(), &request.url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Cache Entry ====================

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response type at the time it was stored.
    pub response_type: ResponseType,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response under the given key, consuming the handle.
    pub fn from_response(key: &RequestKey, response: Response) -> Self {
        let status = response.status.as_u16();
        let response_type = response.response_type;
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status,
            headers,
            response_type,
            body: response.bytes().to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Key this entry is stored under.
    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Approximate bytes this entry occupies against the quota.
    pub fn size(&self) -> u64 {
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        (self.body.len() + headers + self.url.len()) as u64
    }

    /// Build a fresh response handle from this snapshot.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::Cache(format!("stored URL {}: {}", self.url, e)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::Cache(format!("stored status {}: {}", self.status, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(n, v);
            }
        }

        let mut response = Response::new(url, status, Bytes::from(self.body.clone()))
            .with_type(self.response_type)
            .with_source(ResponseSource::Cache);
        response.headers = headers;
        Ok(response)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Cache ====================

/// One cache generation.
#[derive(Debug, Default)]
pub struct Cache {
    /// Generation label.
    pub name: String,

    entries: HashMap<RequestKey, CacheEntry>,
}

impl Cache {
    /// Create a new, empty generation.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request key.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All keys in this generation.
    pub fn keys(&self) -> Vec<&RequestKey> {
        self.entries.keys().collect()
    }

    /// Bytes held by this generation.
    pub fn size(&self) -> u64 {
        self.entries.values().map(CacheEntry::size).sum()
    }

    fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.key(), entry)
    }
}

// ==================== Cache Storage ====================

/// Every cache generation known to the worker.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    quota_bytes: Option<u64>,
    active: Option<String>,
}

impl CacheStorage {
    /// Create new, unbounded cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create cache storage limited to `quota_bytes` across all generations.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Default::default()
        }
    }

    /// Set or clear the quota.
    pub fn set_quota(&mut self, quota_bytes: Option<u64>) {
        self.quota_bytes = quota_bytes;
    }

    /// Generation of the worker that last activated, if any.
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Record which generation the active worker serves from.
    pub fn set_active(&mut self, name: Option<&str>) {
        self.active = name.map(str::to_string);
    }

    /// Open a generation (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches.entry(name.to_string()).or_insert_with(|| {
            debug!(cache = name, "Created cache generation");
            Cache::new(name)
        })
    }

    /// Get a generation without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if a generation exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a generation.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// All generation names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Match a key inside one generation.
    pub fn match_in(&self, name: &str, key: &RequestKey) -> Option<&CacheEntry> {
        self.caches.get(name)?.match_request(key)
    }

    /// Bytes held across all generations.
    pub fn usage_bytes(&self) -> u64 {
        self.caches.values().map(Cache::size).sum()
    }

    /// Store an entry in an existing generation.
    ///
    /// Fails if the generation was deleted in the meantime or the write would
    /// exceed the quota.
    pub fn put(&mut self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        self.put_all(name, vec![entry])
    }

    /// Store a batch of entries in an existing generation. Either every entry
    /// is stored or none is.
    pub fn put_all(&mut self, name: &str, entries: Vec<CacheEntry>) -> Result<(), ServiceWorkerError> {
        let cache = self
            .caches
            .get(name)
            .ok_or_else(|| ServiceWorkerError::CacheWrite(format!("no cache generation '{}'", name)))?;

        if let Some(quota) = self.quota_bytes {
            // a key repeated within the batch is stored once, last write wins
            let mut batch: HashMap<RequestKey, u64> = HashMap::with_capacity(entries.len());
            for entry in &entries {
                batch.insert(entry.key(), entry.size());
            }
            let replaced: u64 = batch
                .keys()
                .filter_map(|key| cache.match_request(key))
                .map(CacheEntry::size)
                .sum();
            let added: u64 = batch.values().sum();
            let projected = self.usage_bytes().saturating_sub(replaced) + added;
            if projected > quota {
                return Err(ServiceWorkerError::QuotaExceeded {
                    requested: added,
                    quota,
                });
            }
        }

        if let Some(cache) = self.caches.get_mut(name) {
            for entry in entries {
                cache.insert(entry);
            }
        }
        Ok(())
    }

    /// Capture every generation for persistence.
    pub fn snapshot(&self) -> StorageSnapshot {
        let mut generations: Vec<GenerationSnapshot> = self
            .caches
            .values()
            .map(|cache| GenerationSnapshot {
                name: cache.name.clone(),
                entries: cache.entries.values().cloned().collect(),
            })
            .collect();
        generations.sort_by(|a, b| a.name.cmp(&b.name));
        StorageSnapshot {
            active: self.active.clone(),
            generations,
        }
    }

    /// Rebuild storage from a snapshot. The quota is not part of the snapshot.
    pub fn from_snapshot(snapshot: StorageSnapshot, quota_bytes: Option<u64>) -> Self {
        let mut storage = Self {
            caches: HashMap::new(),
            quota_bytes,
            active: snapshot.active,
        };
        for generation in snapshot.generations {
            let cache = storage.open(&generation.name);
            for entry in generation.entries {
                cache.insert(entry);
            }
        }
        storage
    }

    /// Write all generations to `path` as JSON.
    pub async fn save(&self, path: &Path) -> Result<(), ServiceWorkerError> {
        let data = serde_json::to_vec(&self.snapshot())
            .map_err(|e| ServiceWorkerError::Persistence(e.to_string()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceWorkerError::Persistence(e.to_string()))?;
        }
        tokio::fs::write(path, data)
            .await
            .map_err(|e| ServiceWorkerError::Persistence(e.to_string()))?;
        info!(path = %path.display(), generations = self.caches.len(), "Saved cache storage");
        Ok(())
    }

    /// Load generations previously written by [`CacheStorage::save`].
    ///
    /// A missing file yields empty storage.
    pub async fn load(path: &Path, quota_bytes: Option<u64>) -> Result<Self, ServiceWorkerError> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot, starting empty");
                return Ok(Self {
                    quota_bytes,
                    ..Default::default()
                });
            }
            Err(e) => return Err(ServiceWorkerError::Persistence(e.to_string())),
        };
        let snapshot: StorageSnapshot = serde_json::from_slice(&data)
            .map_err(|e| ServiceWorkerError::Persistence(e.to_string()))?;
        info!(path = %path.display(), generations = snapshot.generations.len(), "Loaded cache storage");
        Ok(Self::from_snapshot(snapshot, quota_bytes))
    }
}

/// Serializable form of [`CacheStorage`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSnapshot {
    /// Generation of the last activated worker.
    #[serde(default)]
    pub active: Option<String>,
    pub generations: Vec<GenerationSnapshot>,
}

/// Serializable form of one [`Cache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSnapshot {
    pub name: String,
    pub entries: Vec<CacheEntry>,
}
