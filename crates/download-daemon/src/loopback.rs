//! Loopback device transport.
//!
//! Serves a local directory laid out like the handheld (`<root>/SAVED/*`)
//! through the `FtpTransport` contract. Requests are accepted synchronously
//! and completed on spawned tasks, so every outcome reaches the daemon as a
//! `DeviceEvent` on its channel, the same way a real device service reports
//! back through its listener.

use download_core::transport::{
    BindingId, ConnectionState, FolderListingItem, FtpTransport, RemoteError, Result,
    TransportError, TransportEvent,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::debug;

/// OBEX "Not Found" response code
pub const RESPONSE_NOT_FOUND: i32 = 0xC4;
/// OBEX "Internal Server Error" response code
pub const RESPONSE_INTERNAL_ERROR: i32 = 0xD0;

/// Everything the device side reports to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Binding confirmed
    Attached(BindingId),
    /// Binding lost
    Detached(BindingId),
    /// Listener callback issued under `binding`
    Transport {
        binding: BindingId,
        event: TransportEvent,
    },
}

struct Link {
    state: ConnectionState,
    attached: bool,
    /// Incremented on every attach; completions from older bindings are dropped
    binding: u64,
    /// Current folder relative to the device root
    cwd: PathBuf,
}

struct Shared {
    root: PathBuf,
    link: Mutex<Link>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a completion to the binding that issued the request.
    ///
    /// An unbound client has no listener, so its completions go nowhere.
    fn deliver(&self, binding: u64, event: TransportEvent) {
        let link = self.link();
        if !link.attached || link.binding != binding {
            debug!("Dropping {} for released binding", event.name());
            return;
        }
        let _ = self.events.send(DeviceEvent::Transport {
            binding: BindingId::new(binding),
            event,
        });
    }

    /// Link-state changes reach the daemon whether or not anyone is bound,
    /// tagged with the most recent binding.
    fn set_state(&self, to: ConnectionState) {
        let (from, binding) = {
            let mut link = self.link();
            (std::mem::replace(&mut link.state, to), link.binding)
        };
        if from != to {
            let _ = self.events.send(DeviceEvent::Transport {
                binding: BindingId::new(binding),
                event: TransportEvent::StateChanged { from, to },
            });
        }
    }
}

/// `FtpTransport` over a local directory.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    /// Create a transport for the device mirrored at `root`.
    ///
    /// Returns the transport and the receiver for its events.
    pub fn new(root: PathBuf) -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            root,
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                attached: false,
                binding: 0,
                cwd: PathBuf::new(),
            }),
            events,
        });
        (Self { shared }, event_rx)
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// The device connects on its own, as when it is switched on in range.
    pub fn bring_up_link(&self) {
        if self.state() != ConnectionState::Disconnected {
            return;
        }
        self.shared.set_state(ConnectionState::Connecting);
        self.shared.set_state(ConnectionState::Connected);
    }

    /// The device goes out of range.
    pub fn drop_link(&self) {
        self.shared.link().cwd = PathBuf::new();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// The device service drops its client, as when it crashes.
    ///
    /// The link itself stays as it was.
    pub fn revoke_binding(&self) {
        let binding = {
            let mut link = self.shared.link();
            if !link.attached {
                return;
            }
            link.attached = false;
            link.binding
        };
        let _ = self
            .shared
            .events
            .send(DeviceEvent::Detached(BindingId::new(binding)));
    }

    /// Binding id for requests issued now, if requests are allowed.
    fn require_connected(&self) -> Result<u64> {
        let link = self.shared.link();
        if !link.attached {
            return Err(TransportError::NotAttached);
        }
        if link.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        Ok(link.binding)
    }
}

impl FtpTransport for LoopbackTransport {
    fn attach(&self) -> Result<BindingId> {
        let binding = {
            let mut link = self.shared.link();
            if link.attached {
                return Err(TransportError::Rejected("already attached".into()));
            }
            link.attached = true;
            link.binding += 1;
            BindingId::new(link.binding)
        };
        let _ = self.shared.events.send(DeviceEvent::Attached(binding));
        Ok(binding)
    }

    fn detach(&self) {
        let mut link = self.shared.link();
        link.attached = false;
        link.cwd = PathBuf::new();
    }

    fn state(&self) -> ConnectionState {
        self.shared.link().state
    }

    fn connect(&self) -> Result<()> {
        let binding = {
            let link = self.shared.link();
            if !link.attached {
                return Err(TransportError::NotAttached);
            }
            if link.state != ConnectionState::Disconnected {
                return Err(TransportError::Rejected(format!(
                    "link is {:?}",
                    link.state
                )));
            }
            link.binding
        };

        self.shared.set_state(ConnectionState::Connecting);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let reachable = fs::metadata(&shared.root)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);

            if reachable {
                shared.set_state(ConnectionState::Connected);
                shared.deliver(binding, TransportEvent::ConnectComplete(Ok(())));
            } else {
                shared.set_state(ConnectionState::Disconnected);
                shared.deliver(
                    binding,
                    TransportEvent::ConnectComplete(Err(RemoteError::new(RESPONSE_NOT_FOUND))),
                );
            }
        });

        Ok(())
    }

    fn disconnect(&self) {
        let binding = {
            let mut link = self.shared.link();
            if link.state != ConnectionState::Connected {
                return;
            }
            link.cwd = PathBuf::new();
            link.binding
        };

        self.shared.set_state(ConnectionState::Disconnected);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.deliver(binding, TransportEvent::DisconnectComplete(Ok(())));
        });
    }

    fn change_folder(&self, segment: &str) -> Result<()> {
        if segment == "." || segment == ".." || segment.contains(['/', '\\']) {
            return Err(TransportError::Rejected(format!(
                "invalid folder {:?}",
                segment
            )));
        }
        let binding = self.require_connected()?;

        let target = if segment.is_empty() {
            PathBuf::new()
        } else {
            self.shared.link().cwd.join(segment)
        };

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let is_dir = fs::metadata(shared.root.join(&target))
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);

            let result = if is_dir {
                let uri = format!("/{}", target.to_string_lossy());
                shared.link().cwd = target;
                Ok(uri)
            } else {
                Err(RemoteError::new(RESPONSE_NOT_FOUND))
            };
            shared.deliver(binding, TransportEvent::FolderChanged(result));
        });

        Ok(())
    }

    fn list_folder(&self) -> Result<()> {
        let binding = self.require_connected()?;
        let folder = self.shared.root.join(&self.shared.link().cwd);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = list_newest_first(&folder)
                .await
                .map_err(|_| RemoteError::new(RESPONSE_INTERNAL_ERROR));
            shared.deliver(binding, TransportEvent::ListingComplete(result));
        });

        Ok(())
    }

    fn get_file(&self, item: &FolderListingItem) -> Result<()> {
        let binding = self.require_connected()?;
        let path = self
            .shared
            .root
            .join(&self.shared.link().cwd)
            .join(&item.name);

        let item = item.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = match fs::read(&path).await {
                Ok(data) => Ok(item.with_data(data)),
                Err(_) => Err(RemoteError::new(RESPONSE_NOT_FOUND)),
            };
            shared.deliver(binding, TransportEvent::FileRetrieved(result));
        });

        Ok(())
    }
}

/// Files of `folder`, newest first. Ties fall back to name order.
async fn list_newest_first(folder: &Path) -> std::io::Result<Vec<FolderListingItem>> {
    let mut dir = fs::read_dir(folder).await?;
    let mut items = Vec::new();

    while let Some(entry) = dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }

        let mut item =
            FolderListingItem::new(entry.file_name().to_string_lossy().to_string(), metadata.len());
        if let Ok(modified) = metadata.modified() {
            if let Ok(since_epoch) = modified.duration_since(UNIX_EPOCH) {
                item = item.with_modified(since_epoch.as_millis() as u64);
            }
        }
        items.push(item);
    }

    items.sort_by(|a, b| {
        b.modified_millis
            .cmp(&a.modified_millis)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn next(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> DeviceEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for device event")
            .expect("channel closed")
    }

    async fn next_completion(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> TransportEvent {
        loop {
            match next(rx).await {
                DeviceEvent::Transport {
                    event: TransportEvent::StateChanged { .. },
                    ..
                } => continue,
                DeviceEvent::Transport { event, .. } => return event,
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    fn device() -> TempDir {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("SAVED")).unwrap();
        temp
    }

    #[tokio::test]
    async fn test_requests_need_binding_and_link() {
        let temp = device();
        let (transport, _rx) = LoopbackTransport::new(temp.path().to_path_buf());

        assert_eq!(transport.connect(), Err(TransportError::NotAttached));
        transport.attach().unwrap();
        assert!(transport.attach().is_err());
        assert_eq!(transport.list_folder(), Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_and_navigate() {
        let temp = device();
        let (transport, mut rx) = LoopbackTransport::new(temp.path().to_path_buf());

        let binding = transport.attach().unwrap();
        assert_eq!(next(&mut rx).await, DeviceEvent::Attached(binding));

        transport.connect().unwrap();
        assert_eq!(
            next(&mut rx).await,
            DeviceEvent::Transport {
                binding,
                event: TransportEvent::StateChanged {
                    from: ConnectionState::Disconnected,
                    to: ConnectionState::Connecting,
                },
            }
        );
        assert_eq!(
            next_completion(&mut rx).await,
            TransportEvent::ConnectComplete(Ok(()))
        );
        assert_eq!(transport.state(), ConnectionState::Connected);

        transport.change_folder("").unwrap();
        assert_eq!(
            next_completion(&mut rx).await,
            TransportEvent::FolderChanged(Ok("/".into()))
        );

        transport.change_folder("SAVED").unwrap();
        assert_eq!(
            next_completion(&mut rx).await,
            TransportEvent::FolderChanged(Ok("/SAVED".into()))
        );

        transport.change_folder("MISSING").unwrap();
        assert_eq!(
            next_completion(&mut rx).await,
            TransportEvent::FolderChanged(Err(RemoteError::new(RESPONSE_NOT_FOUND)))
        );
    }

    #[tokio::test]
    async fn test_listing_is_newest_first_and_retrieval_carries_data() {
        let temp = device();
        std::fs::write(temp.path().join("SAVED/older.sync"), b"old").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(temp.path().join("SAVED/newer.sync"), b"newest").unwrap();

        let (transport, mut rx) = LoopbackTransport::new(temp.path().to_path_buf());
        transport.bring_up_link();
        transport.attach().unwrap();
        transport.change_folder("SAVED").unwrap();
        next_completion_after_attach(&mut rx).await;

        transport.list_folder().unwrap();
        let items = match next_completion(&mut rx).await {
            TransportEvent::ListingComplete(Ok(items)) => items,
            other => panic!("unexpected {:?}", other),
        };
        let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["newer.sync", "older.sync"]);

        transport.get_file(&items[0]).unwrap();
        match next_completion(&mut rx).await {
            TransportEvent::FileRetrieved(Ok(item)) => {
                assert_eq!(item.name, "newer.sync");
                assert_eq!(item.data.as_deref(), Some(&b"newest"[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    async fn next_completion_after_attach(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>) {
        loop {
            match next(rx).await {
                DeviceEvent::Attached(_) => continue,
                DeviceEvent::Transport {
                    event: TransportEvent::StateChanged { .. },
                    ..
                } => continue,
                DeviceEvent::Transport {
                    event: TransportEvent::FolderChanged(Ok(_)),
                    ..
                } => return,
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_completions_for_released_binding_are_dropped() {
        let temp = device();
        let (transport, mut rx) = LoopbackTransport::new(temp.path().to_path_buf());
        transport.bring_up_link();
        let first = transport.attach().unwrap();

        transport.list_folder().unwrap();
        transport.detach();
        let second = transport.attach().unwrap();
        assert_ne!(first, second);

        // Only link broadcasts and the two attach confirmations arrive
        let mut attached = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
            match event {
                DeviceEvent::Attached(binding) => attached.push(binding),
                DeviceEvent::Transport {
                    event: TransportEvent::StateChanged { .. },
                    ..
                } => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(attached, vec![first, second]);
    }

    #[tokio::test]
    async fn test_revoked_binding_is_reported() {
        let temp = device();
        let (transport, mut rx) = LoopbackTransport::new(temp.path().to_path_buf());
        let binding = transport.attach().unwrap();
        assert_eq!(next(&mut rx).await, DeviceEvent::Attached(binding));

        transport.revoke_binding();
        assert_eq!(next(&mut rx).await, DeviceEvent::Detached(binding));
        assert_eq!(transport.connect(), Err(TransportError::NotAttached));
    }
}
