//! # Carnicería Service Worker
//!
//! Offline cache manager for the Carnicería storefront.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache the asset manifest), activate (evict
//!   stale generations, claim clients)
//! - **Fetch interception**: network-first for backend data, cache-first for
//!   static assets, offline page for failed document loads
//! - **Cache storage**: named generations with an optional byte quota and JSON
//!   snapshots
//! - **Push**: push payload → notification → focus or open a client on click
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     │
//!     └── WorkerScope (shared by every version)
//!             ├── CacheStorage ── Cache ── RequestKey → CacheEntry
//!             ├── Clients
//!             ├── NotificationCenter
//!             └── Fetcher (network)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use carniceria_common::Retryable;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod container;
pub mod notification;
pub mod strategy;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, RequestKey, StorageSnapshot};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use container::{ServiceWorkerContainer, ServiceWorkerRegistration};
pub use notification::{
    Notification, NotificationCenter, NotificationId, NotificationPermission, PushMessage,
};
pub use strategy::{classify, is_storable, Strategy};
pub use worker::{ClickOutcome, ServiceWorker, WorkerScope};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Install failed fetching {url}: {reason}")]
    InstallFetchFailure { url: String, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Cache write failed: {0}")]
    CacheWrite(String),

    #[error("Cache quota exceeded: {requested} more bytes, quota {quota}")]
    QuotaExceeded { requested: u64, quota: u64 },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Push payload error: {0}")]
    PushParse(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<carniceria_core::ConfigError> for ServiceWorkerError {
    fn from(err: carniceria_core::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl Retryable for ServiceWorkerError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InstallFetchFailure { .. } | Self::Network(_) | Self::CacheWrite(_)
        )
    }
}

// ==================== Types ====================

/// Unique identifier for a service worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

/// Events broadcast by the container.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// A new version started installing.
    UpdateFound { cache_name: String },
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A client is now controlled by a different worker.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    /// A push produced a visible notification.
    NotificationShown { id: NotificationId, title: String },
    /// A notification click focused or opened a client.
    NotificationClicked { id: NotificationId, outcome: ClickOutcome },
}
