//! Device transport contract.
//!
//! The transport is an external service that owns the link to the handheld.
//! Requests are accepted or rejected synchronously; their outcome is always
//! reported later through a listener callback. Implementations:
//! - `LoopbackTransport` (in download-daemon) - serves a local directory laid out like the device
//! - test doubles that record requests and let the test feed callbacks

use std::fmt;
use thiserror::Error;

/// Name of the folder on the device that holds saved pages.
pub const SAVED_FOLDER: &str = "SAVED";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Not attached to transport")]
    NotAttached,

    #[error("Not connected to device")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Non-ok result code reported by an asynchronous transport callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote operation failed with code {code}")]
pub struct RemoteError {
    pub code: i32,
}

impl RemoteError {
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

/// Token for one attach/detach cycle.
///
/// Returned by `FtpTransport::attach` and carried by every callback issued
/// under that binding, so callbacks from an earlier binding can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

impl BindingId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding#{}", self.0)
    }
}

/// Connection state of the device link, owned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Folder on the device a navigation step is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderLocation {
    /// The device root, reported as `/`
    Root,
    /// The folder holding saved pages
    SavedFolder,
    /// Anywhere else
    Other(String),
}

impl FolderLocation {
    /// Classify the path of a folder-changed uri.
    pub fn from_path(path: &str) -> Self {
        if path == "/" || path.is_empty() {
            FolderLocation::Root
        } else if path.split('/').any(|segment| segment == SAVED_FOLDER) {
            FolderLocation::SavedFolder
        } else {
            FolderLocation::Other(path.to_string())
        }
    }

    /// Path segment passed to `FtpTransport::change_folder` to reach this location.
    pub fn segment(&self) -> &str {
        match self {
            FolderLocation::Root => "",
            FolderLocation::SavedFolder => SAVED_FOLDER,
            FolderLocation::Other(path) => path,
        }
    }
}

impl fmt::Display for FolderLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FolderLocation::Root => write!(f, "/"),
            FolderLocation::SavedFolder => write!(f, "/{}", SAVED_FOLDER),
            FolderLocation::Other(path) => write!(f, "{}", path),
        }
    }
}

/// One entry of a remote folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderListingItem {
    /// File name on the device (not a full path)
    pub name: String,
    /// File size in bytes as reported by the listing
    pub size: u64,
    /// Modification time in milliseconds since epoch, if the device reports one
    pub modified_millis: Option<u64>,
    /// File contents, only present on items handed back by a retrieval
    pub data: Option<Vec<u8>>,
}

impl FolderListingItem {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            modified_millis: None,
            data: None,
        }
    }

    pub fn with_modified(mut self, modified_millis: u64) -> Self {
        self.modified_millis = Some(modified_millis);
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.size = data.len() as u64;
        self.data = Some(data);
        self
    }
}

/// Listener callbacks delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ConnectComplete(std::result::Result<(), RemoteError>),
    DisconnectComplete(std::result::Result<(), RemoteError>),
    /// Carries the path of the folder now current
    FolderChanged(std::result::Result<String, RemoteError>),
    /// Items are ordered newest first
    ListingComplete(std::result::Result<Vec<FolderListingItem>, RemoteError>),
    DeleteComplete {
        item: FolderListingItem,
        result: std::result::Result<(), RemoteError>,
    },
    FileRetrieved(std::result::Result<FolderListingItem, RemoteError>),
}

impl TransportEvent {
    /// Short callback name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::StateChanged { .. } => "state-changed",
            TransportEvent::ConnectComplete(_) => "connect-complete",
            TransportEvent::DisconnectComplete(_) => "disconnect-complete",
            TransportEvent::FolderChanged(_) => "folder-changed",
            TransportEvent::ListingComplete(_) => "listing-complete",
            TransportEvent::DeleteComplete { .. } => "delete-complete",
            TransportEvent::FileRetrieved(_) => "retrieval-complete",
        }
    }
}

/// Request surface of the device transport.
///
/// Every method returns immediately. `Err` means the request was not accepted
/// and no callback will follow for it. Accepted requests report back through
/// callbacks tagged with the `BindingId` that was live when they were issued.
pub trait FtpTransport: Send + Sync {
    /// Bind to the service; confirmation arrives through `SyncController::on_attached`.
    fn attach(&self) -> Result<BindingId>;

    /// Unbind from the service. Callbacks already in flight may still arrive,
    /// tagged with the released binding.
    fn detach(&self);

    /// Current state of the device link.
    fn state(&self) -> ConnectionState;

    /// Open the file-transfer session.
    fn connect(&self) -> Result<()>;

    /// Close the file-transfer session.
    fn disconnect(&self);

    /// Change the current folder; `""` returns to the root.
    fn change_folder(&self, segment: &str) -> Result<()>;

    /// List the current folder.
    fn list_folder(&self) -> Result<()>;

    /// Retrieve a file of the current folder.
    fn get_file(&self, item: &FolderListingItem) -> Result<()>;
}

/// Callback surface in the shape the transport service calls it.
///
/// Implemented by `SyncController`; every method funnels into the same
/// tagged `TransportEvent` path.
#[async_trait::async_trait]
pub trait TransportListener: Send {
    async fn on_transport_event(&mut self, binding: BindingId, event: TransportEvent);

    async fn on_state_change(
        &mut self,
        binding: BindingId,
        from: ConnectionState,
        to: ConnectionState,
    ) {
        self.on_transport_event(binding, TransportEvent::StateChanged { from, to })
            .await
    }

    async fn on_connect_complete(
        &mut self,
        binding: BindingId,
        result: std::result::Result<(), RemoteError>,
    ) {
        self.on_transport_event(binding, TransportEvent::ConnectComplete(result))
            .await
    }

    async fn on_disconnect_complete(
        &mut self,
        binding: BindingId,
        result: std::result::Result<(), RemoteError>,
    ) {
        self.on_transport_event(binding, TransportEvent::DisconnectComplete(result))
            .await
    }

    async fn on_change_folder_complete(
        &mut self,
        binding: BindingId,
        result: std::result::Result<String, RemoteError>,
    ) {
        self.on_transport_event(binding, TransportEvent::FolderChanged(result))
            .await
    }

    async fn on_folder_listing_complete(
        &mut self,
        binding: BindingId,
        result: std::result::Result<Vec<FolderListingItem>, RemoteError>,
    ) {
        self.on_transport_event(binding, TransportEvent::ListingComplete(result))
            .await
    }

    async fn on_delete_complete(
        &mut self,
        binding: BindingId,
        item: FolderListingItem,
        result: std::result::Result<(), RemoteError>,
    ) {
        self.on_transport_event(binding, TransportEvent::DeleteComplete { item, result })
            .await
    }

    async fn on_get_file_complete(
        &mut self,
        binding: BindingId,
        result: std::result::Result<FolderListingItem, RemoteError>,
    ) {
        self.on_transport_event(binding, TransportEvent::FileRetrieved(result))
            .await
    }
}
