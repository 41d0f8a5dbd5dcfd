//! # Portal offline worker
//!
//! Offline caching for the student/admin portal: every outbound request of the
//! application is intercepted, routed to a caching discipline and answered from
//! a versioned cache store, the network, or a deterministic offline fallback.
//!
//! ## Features
//!
//! - **Precache**: all-or-nothing install of the static shell
//! - **Routing**: cross-origin passthrough, network-first data calls,
//!   cache-first static assets
//! - **Versioning**: activation evicts every cache but the current version
//! - **Storage**: in-memory or SQLite-backed cache store
//! - **Events**: background sync hook, push notifications, notification clicks
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     └── ServiceWorkerRegistration (scope)
//!             └── active: OfflineWorker
//!                     ├── Router ──► Strategy (NetworkFirst | CacheFirst)
//!                     └── CacheStorage ──► CacheBackend (Memory | Sqlite)
//! ```

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod fallback;
pub mod router;
pub mod sqlite;
pub mod strategy;
pub mod worker;

#[cfg(test)]
mod testing;

pub use cache::{Cache, CacheBackend, CacheKey, CacheStorage, CachedResponse, MemoryBackend};
pub use clients::{Client, ClientId, ClientMatchOptions, ClientType, Clients};
pub use config::{NotificationConfig, StorageConfig, WorkerConfig};
pub use container::{
    RegistrationSnapshot, ServiceWorker, ServiceWorkerContainer, ServiceWorkerEvent,
    ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState, WorkerSnapshot,
};
pub use error::{CacheError, ServiceWorkerError};
pub use events::{
    Notification, NotificationData, NotificationId, NotificationOptions, Notifications,
    SyncOutcome, SYNC_RESULTS_TAG,
};
pub use fallback::{is_offline_fallback, offline_response, OFFLINE_MARKER_HEADER};
pub use router::{Disposition, Router};
pub use sqlite::SqliteBackend;
pub use strategy::{FetchOutcome, ResponseSource, Strategy};
pub use worker::OfflineWorker;
