//! Event loop tying the device, the triggers and the controller together.
//!
//! Device events and triggers arrive on two channels and are handled one at
//! a time, so the controller never sees two callbacks at once.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use download_core::transport::SAVED_FOLDER;
use download_core::{
    EventBus, LocalStorage, RunOutcome, SyncController, TransportEvent, TriggerEvent,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::loopback::{DeviceEvent, LoopbackTransport};
use crate::native_storage::NativeStorage;
use crate::watcher::SaveFolderWatcher;

pub struct Daemon<S: LocalStorage> {
    controller: SyncController<S>,
    device: Arc<LoopbackTransport>,
    device_rx: mpsc::UnboundedReceiver<DeviceEvent>,
    trigger_tx: mpsc::UnboundedSender<TriggerEvent>,
    trigger_rx: mpsc::UnboundedReceiver<TriggerEvent>,
    run_timeout: Option<Duration>,
    /// When the active run gets aborted
    deadline: Option<Instant>,
    _watcher: Option<SaveFolderWatcher>,
}

impl Daemon<NativeStorage> {
    /// Build a daemon over the configured device and storage directories.
    pub fn from_config(config: &DaemonConfig, events: Arc<EventBus>) -> Result<Self> {
        let device_dir = config.device_dir()?;
        let (device, device_rx) = LoopbackTransport::new(device_dir.to_path_buf());
        let storage = NativeStorage::new(config.storage_dir.clone());

        let mut daemon = Self::new(device, device_rx, storage, events, config.run_timeout());
        if config.watch_saved_folder {
            daemon.watch_saved_folder(&device_dir.join(SAVED_FOLDER))?;
        }
        Ok(daemon)
    }
}

impl<S: LocalStorage> Daemon<S> {
    pub fn new(
        device: LoopbackTransport,
        device_rx: mpsc::UnboundedReceiver<DeviceEvent>,
        storage: S,
        events: Arc<EventBus>,
        run_timeout: Option<Duration>,
    ) -> Self {
        let device = Arc::new(device);
        let controller = SyncController::new(device.clone(), storage, events);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();

        Self {
            controller,
            device,
            device_rx,
            trigger_tx,
            trigger_rx,
            run_timeout,
            deadline: None,
            _watcher: None,
        }
    }

    /// Press Save whenever a page shows up in `saved_dir`.
    pub fn watch_saved_folder(&mut self, saved_dir: &Path) -> Result<()> {
        let watcher = SaveFolderWatcher::new(saved_dir.to_path_buf(), self.trigger_tx.clone())
            .with_context(|| format!("Failed to watch {:?}", saved_dir))?;
        info!("Watching {:?} for saved pages", watcher.saved_dir());
        self._watcher = Some(watcher);
        Ok(())
    }

    /// Sender for injecting triggers (button presses) into the loop.
    pub fn triggers(&self) -> mpsc::UnboundedSender<TriggerEvent> {
        self.trigger_tx.clone()
    }

    pub fn device(&self) -> &LoopbackTransport {
        &self.device
    }

    pub fn controller(&self) -> &SyncController<S> {
        &self.controller
    }

    /// Handle one event. Returns false once every source has closed.
    pub async fn step(&mut self) -> bool {
        let deadline = self.deadline;

        let handled = tokio::select! {
            Some(event) = self.device_rx.recv() => {
                self.on_device_event(event).await;
                true
            }
            Some(trigger) = self.trigger_rx.recv() => {
                self.on_trigger(trigger);
                true
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                warn!("Run exceeded {:?}, aborting", self.run_timeout.unwrap_or_default());
                self.controller.abort();
                true
            }
            else => false,
        };

        if !self.controller.is_running() {
            self.deadline = None;
        }
        handled
    }

    /// Process events until `shutdown` resolves, then end any active run.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                running = self.step() => {
                    if !running {
                        break;
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if self.controller.abort() {
            info!("Cancelled the active run");
        }
    }

    /// Step until the run in progress finishes, returning its outcome.
    ///
    /// Returns `None` if no run is active or every source closed first.
    pub async fn run_to_completion(&mut self) -> Option<RunOutcome> {
        while self.controller.is_running() {
            if !self.step().await {
                return None;
            }
        }
        self.controller.last_outcome().cloned()
    }

    async fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Attached(binding) => self.controller.on_attached(binding).await,
            DeviceEvent::Detached(binding) => self.controller.on_detached(binding),
            DeviceEvent::Transport { binding, event } => {
                let trigger = match &event {
                    TransportEvent::StateChanged { from, to } => {
                        Some(TriggerEvent::ConnectionStateChanged {
                            from: *from,
                            to: *to,
                        })
                    }
                    _ => None,
                };

                self.controller.handle_transport_event(binding, event).await;

                // A link coming up on its own starts a run
                if let Some(trigger) = trigger {
                    self.on_trigger(trigger);
                }
            }
        }
    }

    fn on_trigger(&mut self, trigger: TriggerEvent) {
        if self.controller.on_trigger(trigger) && self.deadline.is_none() {
            self.deadline = self.run_timeout.map(|timeout| Instant::now() + timeout);
        } else {
            debug!("No new run for {:?}", trigger);
        }
    }
}
