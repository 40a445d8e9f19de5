//! download-core: Fetches the newest saved page from a paired handheld device.
//!
//! This crate provides:
//! - The transport contract the device service exposes (`FtpTransport`, `TransportEvent`)
//! - A pure state machine for the connect/navigate/list/retrieve sequence
//! - `SyncController`, which owns one run at a time and tears it down on every exit path
//! - Name-based deduplication against local storage
//! - `LocalStorage` and `EventBus` abstractions for persistence and notifications

pub mod controller;
pub mod dedup;
pub mod error;
pub mod events;
pub mod machine;
pub mod storage;
pub mod transport;
pub mod trigger;

pub use controller::SyncController;
pub use dedup::{LocalFileSet, should_download};
pub use error::SyncError;
pub use events::{DownloadEvent, EventBus, SAVED_NEW_FILE, Subscription};
pub use machine::{RunOutcome, Step};
pub use storage::{InMemoryStorage, LocalStorage, StorageError};
pub use transport::{
    BindingId, ConnectionState, FolderListingItem, FolderLocation, FtpTransport, RemoteError,
    TransportError, TransportEvent, TransportListener,
};
pub use trigger::{Button, TriggerEvent};
