//! Runtime-facing services shared by clients.

mod sync_state;

pub use sync_state::SyncStateService;
