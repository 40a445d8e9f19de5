//! SyncController: lifecycle of a single download run.
//!
//! The controller owns the one live `SyncSession` and the transport binding.
//! Hosts feed it triggers and transport callbacks on a single execution
//! context; every entry point returns as soon as the next request is issued.
//!
//! Teardown happens by dropping the session: its `Attachment` disconnects the
//! device if this run holds the connection and then unbinds from the
//! transport, whichever way the run ends. Callbacks carry the `BindingId` they
//! were issued under; any that do not match the live session are discarded.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dedup::LocalFileSet;
use crate::error::SyncError;
use crate::events::{DownloadEvent, EventBus};
use crate::machine::{self, Command, Input, RunOutcome, Step, Transition};
use crate::storage::LocalStorage;
use crate::transport::{
    BindingId, ConnectionState, FtpTransport, TransportError, TransportEvent, TransportListener,
};
use crate::trigger::TriggerEvent;

/// Scoped hold on the transport binding.
struct Attachment {
    transport: Arc<dyn FtpTransport>,
    binding: BindingId,
    /// Binding still held by us
    attached: bool,
    /// This run owns an open device connection
    connected: bool,
}

impl Attachment {
    fn acquire(transport: Arc<dyn FtpTransport>) -> Result<Self, TransportError> {
        let binding = transport.attach()?;
        Ok(Self {
            transport,
            binding,
            attached: true,
            connected: false,
        })
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        if self.connected {
            self.transport.disconnect();
        }
        self.transport.detach();
    }
}

/// Mutable state of the run in progress.
struct SyncSession {
    run_id: Uuid,
    step: Step,
    attachment: Attachment,
}

/// Drives download runs against a device transport.
pub struct SyncController<S: LocalStorage> {
    transport: Arc<dyn FtpTransport>,
    storage: S,
    events: Arc<EventBus>,
    session: Option<SyncSession>,
    last_outcome: Option<RunOutcome>,
    /// Step the most recent run was in when it ended
    last_step: Option<&'static str>,
}

impl<S: LocalStorage> SyncController<S> {
    pub fn new(transport: Arc<dyn FtpTransport>, storage: S, events: Arc<EventBus>) -> Self {
        Self {
            transport,
            storage,
            events,
            session: None,
            last_outcome: None,
            last_step: None,
        }
    }

    /// Start a run if `event` asks for one and no run is active.
    ///
    /// Returns true if a session is live after the call. A trigger arriving
    /// during a run is dropped.
    pub fn on_trigger(&mut self, event: TriggerEvent) -> bool {
        if !event.starts_run() {
            return false;
        }

        if let Some(session) = &self.session {
            debug!(
                "Ignoring {:?}: run {} is still {}",
                event,
                session.run_id,
                session.step.name()
            );
            return false;
        }

        let run_id = Uuid::new_v4();
        info!("Starting download run {} ({:?})", run_id, event);

        match Attachment::acquire(Arc::clone(&self.transport)) {
            Ok(attachment) => {
                debug!("Run {} holds {}", run_id, attachment.binding);
                self.session = Some(SyncSession {
                    run_id,
                    step: Step::Attaching,
                    attachment,
                });
                true
            }
            Err(source) => {
                warn!("Could not bind to transport for run {}: {}", run_id, source);
                self.last_outcome = Some(RunOutcome::Failed(SyncError::TransportRejected {
                    operation: "attach",
                    source,
                }));
                false
            }
        }
    }

    /// The transport confirmed `binding` is live.
    pub async fn on_attached(&mut self, binding: BindingId) {
        let Some(session) = live_session(&mut self.session, binding) else {
            debug!("Discarding attach confirmation for {}", binding);
            return;
        };

        let state = self.transport.state();
        if session.step == Step::Attaching && state == ConnectionState::Connected {
            debug!("Device already connected, skipping connect");
            session.attachment.connected = true;
        }

        self.advance(Input::Attached { state }, LocalFileSet::new())
            .await;
    }

    /// The transport dropped `binding` underneath the run.
    pub fn on_detached(&mut self, binding: BindingId) {
        let Some(session) = live_session(&mut self.session, binding) else {
            debug!("Discarding detach notice for {}", binding);
            return;
        };
        session.attachment.attached = false;
        self.terminate(RunOutcome::Failed(SyncError::TransportLost));
    }

    /// Feed one listener callback, issued under `binding`, into the active run.
    pub async fn handle_transport_event(&mut self, binding: BindingId, event: TransportEvent) {
        let Some(session) = live_session(&mut self.session, binding) else {
            debug!("Discarding stale {} callback for {}", event.name(), binding);
            return;
        };

        match &event {
            TransportEvent::ConnectComplete(Ok(())) if session.step == Step::AwaitingConnect => {
                session.attachment.connected = true;
            }
            TransportEvent::StateChanged {
                to: ConnectionState::Disconnected,
                ..
            }
            | TransportEvent::DisconnectComplete(_) => {
                session.attachment.connected = false;
            }
            _ => {}
        }

        // Only a successful listing is checked against local files
        let local = match &event {
            TransportEvent::ListingComplete(Ok(_)) if session.step.needs_local_files() => {
                match self.storage.snapshot().await {
                    Ok(local) => local,
                    Err(e) => {
                        self.terminate(RunOutcome::Failed(e.into()));
                        return;
                    }
                }
            }
            _ => LocalFileSet::new(),
        };

        self.advance(Input::Transport(event), local).await;
    }

    /// End the active run. Idempotent: returns false if no run was active.
    pub fn terminate(&mut self, outcome: RunOutcome) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };

        match &outcome {
            RunOutcome::Saved { name } => {
                info!("Run {} finished: saved {}", session.run_id, name)
            }
            RunOutcome::Skipped { name } => {
                info!("Run {} finished: {} already downloaded", session.run_id, name)
            }
            RunOutcome::Failed(e) if e.is_no_op() => {
                info!("Run {} finished: {}", session.run_id, e)
            }
            RunOutcome::Failed(e) => {
                warn!(
                    "Run {} failed while {}: {}",
                    session.run_id,
                    session.step.name(),
                    e
                )
            }
        }

        self.last_step = Some(session.step.name());

        // Disconnects and detaches
        drop(session);

        self.last_outcome = Some(outcome);
        true
    }

    /// Cancel the active run, if any.
    pub fn abort(&mut self) -> bool {
        self.terminate(RunOutcome::Failed(SyncError::Cancelled))
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Step of the active run.
    pub fn current_step(&self) -> Option<&Step> {
        self.session.as_ref().map(|s| &s.step)
    }

    /// Binding held by the active run.
    pub fn binding(&self) -> Option<BindingId> {
        self.session.as_ref().map(|s| s.attachment.binding)
    }

    /// Outcome of the most recently finished run.
    pub fn last_outcome(&self) -> Option<&RunOutcome> {
        self.last_outcome.as_ref()
    }

    /// Step the most recently finished run had reached when it ended.
    pub fn last_step(&self) -> Option<&'static str> {
        self.last_step
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    async fn advance(&mut self, input: Input, local: LocalFileSet) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let Transition { next, commands } = machine::transition(&session.step, input, &local);

        // The current step stands until its commands have gone through
        for command in commands {
            if let Err(e) = self.execute(command).await {
                self.finish(RunOutcome::Failed(e));
                return;
            }
        }

        if let Step::Done(outcome) = next {
            self.finish(outcome);
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        if next.name() != session.step.name() {
            debug!(
                "Run {}: {} -> {}",
                session.run_id,
                session.step.name(),
                next.name()
            );
        }
        session.step = next;
    }

    async fn execute(&self, command: Command) -> Result<(), SyncError> {
        match command {
            Command::Connect => self.transport.connect().map_err(rejected("connect")),
            Command::ChangeFolder(location) => {
                debug!("Navigating to {}", location);
                self.transport
                    .change_folder(location.segment())
                    .map_err(rejected("change folder"))
            }
            Command::ListFolder => self.transport.list_folder().map_err(rejected("list folder")),
            Command::GetFile(item) => {
                debug!("Requesting {} ({} bytes)", item.name, item.size);
                self.transport
                    .get_file(&item)
                    .map_err(rejected("get file"))
            }
            Command::Save { name, data } => {
                self.storage.write(&name, &data).await?;
                debug!("Wrote {} ({} bytes)", name, data.len());
                Ok(())
            }
        }
    }

    fn finish(&mut self, outcome: RunOutcome) {
        let saved = outcome.is_saved();
        if self.terminate(outcome) && saved {
            self.events.emit(DownloadEvent::SavedNewFile);
        }
    }
}

/// The session, if `binding` is the one it holds.
fn live_session(
    session: &mut Option<SyncSession>,
    binding: BindingId,
) -> Option<&mut SyncSession> {
    session
        .as_mut()
        .filter(|session| session.attachment.binding == binding)
}

fn rejected(operation: &'static str) -> impl FnOnce(TransportError) -> SyncError {
    move |source| SyncError::TransportRejected { operation, source }
}

#[async_trait::async_trait]
impl<S: LocalStorage> TransportListener for SyncController<S> {
    async fn on_transport_event(&mut self, binding: BindingId, event: TransportEvent) {
        self.handle_transport_event(binding, event).await
    }
}
