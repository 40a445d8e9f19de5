//! End-to-end tests for download-daemon.
//!
//! Runs the daemon event loop against a temporary device directory and a
//! temporary storage directory, with the loopback transport in between.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use download_core::{
    Button, ConnectionState, EventBus, FtpTransport, LocalStorage, RunOutcome, Step, Subscription,
    SyncError, TriggerEvent,
};
use download_daemon::{Daemon, LoopbackTransport, NativeStorage};
use tempfile::TempDir;
use tokio::time::timeout;

// ============================================================================
// Helpers
// ============================================================================

struct TestDaemon {
    daemon: Daemon<NativeStorage>,
    notifications: Arc<AtomicUsize>,
    _subscription: Subscription,
    device_dir: TempDir,
    _storage_dir: TempDir,
}

impl TestDaemon {
    /// Device with a `SAVED` folder holding `pages`, written oldest first.
    fn with_pages(pages: &[(&str, &[u8])]) -> Self {
        let device_dir = TempDir::new().unwrap();
        let saved = device_dir.path().join("SAVED");
        std::fs::create_dir(&saved).unwrap();
        for (name, content) in pages {
            std::fs::write(saved.join(name), content).unwrap();
            // Distinct mtimes so the listing order is stable
            std::thread::sleep(Duration::from_millis(20));
        }
        Self::over(device_dir, None)
    }

    fn over(device_dir: TempDir, run_timeout: Option<Duration>) -> Self {
        let storage_dir = TempDir::new().unwrap();
        let (device, device_rx) = LoopbackTransport::new(device_dir.path().to_path_buf());
        let storage = NativeStorage::new(storage_dir.path().join("downloads"));

        let events = Arc::new(EventBus::new());
        let notifications = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notifications);
        let subscription = events.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        Self {
            daemon: Daemon::new(device, device_rx, storage, events, run_timeout),
            notifications,
            _subscription: subscription,
            device_dir,
            _storage_dir: storage_dir,
        }
    }

    fn press_save(&self) {
        self.daemon
            .triggers()
            .send(TriggerEvent::ButtonPressed(Button::Save))
            .unwrap();
    }

    /// Step until a run has started.
    async fn until_running(&mut self) {
        timeout(Duration::from_secs(5), async {
            while !self.daemon.controller().is_running() {
                assert!(self.daemon.step().await, "event sources closed");
            }
        })
        .await
        .expect("timed out waiting for a run to start");
    }

    /// Step until the active run finishes.
    async fn finish(&mut self) -> RunOutcome {
        timeout(Duration::from_secs(5), self.daemon.run_to_completion())
            .await
            .expect("timed out waiting for the run to finish")
            .expect("run ended without an outcome")
    }

    async fn press_save_and_finish(&mut self) -> RunOutcome {
        self.press_save();
        self.until_running().await;
        self.finish().await
    }

    async fn stored(&self) -> Vec<String> {
        let mut names = self.daemon.controller().storage().list_files().await.unwrap();
        names.sort();
        names
    }

    fn notifications(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }

    fn saved_dir(&self) -> std::path::PathBuf {
        self.device_dir.path().join("SAVED")
    }
}

fn saved(name: &str) -> RunOutcome {
    RunOutcome::Saved { name: name.into() }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_downloads_newest_page_once() {
    let mut t = TestDaemon::with_pages(&[("page1.sync", b"first"), ("page2.sync", b"second")]);

    assert_eq!(t.press_save_and_finish().await, saved("page2.sync"));
    assert_eq!(t.stored().await, vec!["page2.sync"]);
    assert_eq!(
        t.daemon.controller().storage().read("page2.sync").await.unwrap(),
        b"second"
    );
    assert_eq!(t.notifications(), 1);
    assert_eq!(t.daemon.device().state(), ConnectionState::Disconnected);

    // Same newest page: nothing new to fetch
    assert_eq!(
        t.press_save_and_finish().await,
        RunOutcome::Skipped {
            name: "page2.sync".into()
        }
    );
    assert_eq!(t.stored().await, vec!["page2.sync"]);
    assert_eq!(t.notifications(), 1);
}

#[tokio::test]
async fn test_new_page_after_previous_download() {
    let mut t = TestDaemon::with_pages(&[("page1.sync", b"first")]);
    assert_eq!(t.press_save_and_finish().await, saved("page1.sync"));

    std::thread::sleep(Duration::from_millis(20));
    std::fs::write(t.saved_dir().join("page2.sync"), b"second").unwrap();

    assert_eq!(t.press_save_and_finish().await, saved("page2.sync"));
    assert_eq!(t.stored().await, vec!["page1.sync", "page2.sync"]);
    assert_eq!(t.notifications(), 2);
}

#[tokio::test]
async fn test_link_coming_up_starts_a_run() {
    let mut t = TestDaemon::with_pages(&[("page1.sync", b"ink")]);

    t.daemon.device().bring_up_link();
    t.until_running().await;

    assert_eq!(t.finish().await, saved("page1.sync"));
    assert_eq!(t.notifications(), 1);
    // The run took over the open link and closed it
    assert_eq!(t.daemon.device().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_missing_saved_folder_fails_cleanly() {
    let mut t = TestDaemon::over(TempDir::new().unwrap(), None);

    match t.press_save_and_finish().await {
        RunOutcome::Failed(SyncError::RemoteOperationFailed { operation, .. }) => {
            assert_eq!(operation, "change folder");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(t.stored().await.is_empty());
    assert_eq!(t.notifications(), 0);
    assert_eq!(t.daemon.device().state(), ConnectionState::Disconnected);

    // Nothing is left bound: the next run can attach
    std::fs::create_dir(t.saved_dir()).unwrap();
    std::fs::write(t.saved_dir().join("page1.sync"), b"ink").unwrap();
    assert_eq!(t.press_save_and_finish().await, saved("page1.sync"));
}

#[tokio::test]
async fn test_empty_saved_folder_is_a_no_op() {
    let mut t = TestDaemon::with_pages(&[]);

    assert_eq!(
        t.press_save_and_finish().await,
        RunOutcome::Failed(SyncError::EmptyRemoteListing)
    );
    assert!(t.stored().await.is_empty());
    assert_eq!(t.notifications(), 0);
}

#[tokio::test]
async fn test_link_drop_mid_run() {
    let mut t = TestDaemon::with_pages(&[("page1.sync", b"ink")]);
    t.press_save();

    timeout(Duration::from_secs(5), async {
        while t.daemon.controller().current_step() != Some(&Step::AwaitingSavedFolder) {
            assert!(t.daemon.step().await);
        }
    })
    .await
    .expect("timed out waiting for navigation");

    t.daemon.device().drop_link();

    assert_eq!(
        t.finish().await,
        RunOutcome::Failed(SyncError::ConnectionLost)
    );
    assert!(t.stored().await.is_empty());
}

#[tokio::test]
async fn test_binding_revoked_mid_run() {
    let mut t = TestDaemon::with_pages(&[("page1.sync", b"ink")]);
    t.press_save();

    timeout(Duration::from_secs(5), async {
        while t.daemon.controller().current_step() != Some(&Step::AwaitingConnect) {
            assert!(t.daemon.step().await);
        }
    })
    .await
    .expect("timed out waiting for connect");

    t.daemon.device().revoke_binding();

    assert_eq!(
        t.finish().await,
        RunOutcome::Failed(SyncError::TransportLost)
    );
    assert_eq!(t.notifications(), 0);
}

#[tokio::test]
async fn test_stalled_run_times_out() {
    let device_dir = TempDir::new().unwrap();
    std::fs::create_dir(device_dir.path().join("SAVED")).unwrap();
    let mut t = TestDaemon::over(device_dir, Some(Duration::from_millis(200)));
    t.press_save();

    timeout(Duration::from_secs(5), async {
        while t.daemon.controller().current_step() != Some(&Step::AwaitingConnect) {
            assert!(t.daemon.step().await);
        }
    })
    .await
    .expect("timed out waiting for connect");

    // Unbind without telling the daemon; the connect completion never arrives
    t.daemon.device().detach();

    assert_eq!(t.finish().await, RunOutcome::Failed(SyncError::Cancelled));
}

#[tokio::test]
async fn test_saved_page_on_device_triggers_download() {
    let mut t = TestDaemon::with_pages(&[]);
    let saved_dir = t.saved_dir();
    t.daemon.watch_saved_folder(&saved_dir).unwrap();

    // Let the watcher settle before writing
    tokio::time::sleep(Duration::from_millis(100)).await;
    write_page(&saved_dir, "page1.sync", b"ink");

    timeout(Duration::from_secs(10), async {
        while t.daemon.controller().last_outcome().is_none() || t.daemon.controller().is_running()
        {
            assert!(t.daemon.step().await);
        }
    })
    .await
    .expect("timed out waiting for the watcher to trigger a run");

    assert_eq!(
        t.daemon.controller().last_outcome(),
        Some(&saved("page1.sync"))
    );
    assert_eq!(t.stored().await, vec!["page1.sync"]);
}

fn write_page(dir: &Path, name: &str, content: &[u8]) {
    std::fs::write(dir.join(name), content).unwrap();
}
