//! synclog-core - Local state store for peer-to-peer file sync
//!
//! This crate holds the event log and the tree it reconstructs, the
//! known-file index consulted by the filesystem watcher, and the
//! content-addressable copy store, together with the transactional session
//! layer they share.

pub mod alerts;
pub mod config;
pub mod copies;
pub mod db;
pub mod error;
pub mod events;
pub mod index;
pub mod models;
pub mod services;
pub mod state;
pub mod util;

pub use alerts::{StoreAlert, StoreAlertKind, StoreAlerts, StoreKind};
pub use config::{ConfigError, StoreConfig};
pub use copies::CopyStore;
pub use error::{Error, Result};
pub use events::{EventStore, FileWalk, SoftLockGuard};
pub use index::KnownFileIndex;
pub use models::{Event, EventId, EventState, EventType, File, FileId, KnownFile, NewEvent, NewFile};
pub use services::SyncStateService;
pub use state::{MaintenanceReport, StateStatus, SyncState};
