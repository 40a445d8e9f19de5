//! download-daemon library: Exposes the daemon components for testing.
//!
//! The binary wires these together; integration tests drive them directly
//! against a temporary device directory.

pub mod config;
pub mod daemon;
pub mod loopback;
pub mod native_storage;
pub mod watcher;

pub use config::{ConfigOverrides, DaemonConfig};
pub use daemon::Daemon;
pub use loopback::{DeviceEvent, LoopbackTransport};
pub use native_storage::NativeStorage;
pub use watcher::SaveFolderWatcher;
