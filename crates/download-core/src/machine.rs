//! Download run state machine.
//!
//! A run walks the device in a fixed order and only ever reacts to callbacks:
//!
//! ```text
//! Attaching → AwaitingConnect → AwaitingRootFolder → AwaitingSavedFolder
//!     │                                                      │
//!     └──(already connected)──→ AwaitingRootFolder           ↓
//!                                       AwaitingListing → AwaitingRetrieval → Done
//! ```
//!
//! Any failure or out-of-order callback goes straight to `Done(Failed)`.
//! `transition` is pure: it returns the next step plus the requests the
//! controller must issue, and never touches the transport itself.

use crate::dedup::{LocalFileSet, should_download};
use crate::error::SyncError;
use crate::transport::{
    ConnectionState, FolderListingItem, FolderLocation, RemoteError, TransportEvent,
};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The newest file was retrieved and written under this name
    Saved { name: String },
    /// The newest file was already present locally
    Skipped { name: String },
    Failed(SyncError),
}

impl RunOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, RunOutcome::Saved { .. })
    }
}

/// Position of a run in the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Waiting for the transport binding to come up
    Attaching,
    AwaitingConnect,
    AwaitingRootFolder,
    AwaitingSavedFolder,
    AwaitingListing,
    /// Waiting for the contents of the named file
    AwaitingRetrieval { name: String },
    Done(RunOutcome),
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Attaching => "attaching",
            Step::AwaitingConnect => "awaiting connect",
            Step::AwaitingRootFolder => "awaiting root folder",
            Step::AwaitingSavedFolder => "awaiting saved folder",
            Step::AwaitingListing => "awaiting listing",
            Step::AwaitingRetrieval { .. } => "awaiting retrieval",
            Step::Done(_) => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Step::Done(_))
    }

    /// Whether the next transition reads the local file set.
    pub fn needs_local_files(&self) -> bool {
        matches!(self, Step::AwaitingListing)
    }
}

/// Input fed to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Transport binding is live; carries the link state at that moment
    Attached { state: ConnectionState },
    Transport(TransportEvent),
}

/// Request the controller must carry out, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    ChangeFolder(FolderLocation),
    ListFolder,
    GetFile(FolderListingItem),
    Save { name: String, data: Vec<u8> },
}

/// Result of feeding one input to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Step,
    pub commands: Vec<Command>,
}

impl Transition {
    fn to(next: Step, commands: Vec<Command>) -> Self {
        Self { next, commands }
    }

    fn stay(step: &Step) -> Self {
        Self {
            next: step.clone(),
            commands: Vec::new(),
        }
    }

    fn fail(error: SyncError) -> Self {
        Self {
            next: Step::Done(RunOutcome::Failed(error)),
            commands: Vec::new(),
        }
    }
}

/// Compute the next step for `input`.
///
/// `local` is only consulted while `step.needs_local_files()`; callers may pass
/// an empty set otherwise.
pub fn transition(step: &Step, input: Input, local: &LocalFileSet) -> Transition {
    if step.is_done() {
        return Transition::stay(step);
    }

    let event = match input {
        Input::Attached { state } => return on_attached(step, state),
        Input::Transport(event) => event,
    };

    match (step, event) {
        // Nothing is established yet; link noise belongs to an earlier run
        (Step::Attaching, TransportEvent::StateChanged { .. })
        | (Step::Attaching, TransportEvent::DisconnectComplete(_)) => Transition::stay(step),

        // Link-level notifications are valid in every other step
        (_, TransportEvent::StateChanged { to, .. }) if to == ConnectionState::Disconnected => {
            Transition::fail(SyncError::ConnectionLost)
        }
        (_, TransportEvent::StateChanged { .. }) => Transition::stay(step),
        (_, TransportEvent::DisconnectComplete(_)) => Transition::fail(SyncError::ConnectionLost),
        (_, TransportEvent::DeleteComplete { .. }) => Transition::stay(step),

        (Step::AwaitingConnect, TransportEvent::ConnectComplete(result)) => match result {
            Ok(()) => Transition::to(
                Step::AwaitingRootFolder,
                vec![Command::ChangeFolder(FolderLocation::Root)],
            ),
            Err(source) => Transition::fail(SyncError::RemoteOperationFailed {
                operation: "connect",
                source,
            }),
        },

        (Step::AwaitingRootFolder, TransportEvent::FolderChanged(result)) => {
            on_folder_changed(
                result,
                FolderLocation::Root,
                Transition::to(
                    Step::AwaitingSavedFolder,
                    vec![Command::ChangeFolder(FolderLocation::SavedFolder)],
                ),
            )
        }

        (Step::AwaitingSavedFolder, TransportEvent::FolderChanged(result)) => {
            on_folder_changed(
                result,
                FolderLocation::SavedFolder,
                Transition::to(Step::AwaitingListing, vec![Command::ListFolder]),
            )
        }

        (Step::AwaitingListing, TransportEvent::ListingComplete(result)) => match result {
            Ok(items) => on_listing(items, local),
            Err(source) => Transition::fail(SyncError::RemoteOperationFailed {
                operation: "list folder",
                source,
            }),
        },

        (Step::AwaitingRetrieval { name }, TransportEvent::FileRetrieved(result)) => match result {
            Ok(item) if item.name != *name => Transition::fail(SyncError::UnexpectedItem {
                expected: name.clone(),
                actual: item.name,
            }),
            Ok(FolderListingItem {
                name,
                data: Some(data),
                ..
            }) => Transition::to(
                Step::Done(RunOutcome::Saved { name: name.clone() }),
                vec![Command::Save { name, data }],
            ),
            Ok(item) => Transition::fail(SyncError::MissingPayload { name: item.name }),
            Err(source) => Transition::fail(SyncError::RemoteOperationFailed {
                operation: "get file",
                source,
            }),
        },

        (step, event) => Transition::fail(SyncError::UnexpectedCallback {
            step: step.name(),
            callback: event.name(),
        }),
    }
}

fn on_attached(step: &Step, state: ConnectionState) -> Transition {
    match (step, state) {
        (Step::Attaching, ConnectionState::Connected) => Transition::to(
            Step::AwaitingRootFolder,
            vec![Command::ChangeFolder(FolderLocation::Root)],
        ),
        (Step::Attaching, _) => Transition::to(Step::AwaitingConnect, vec![Command::Connect]),
        (step, _) => Transition::fail(SyncError::UnexpectedCallback {
            step: step.name(),
            callback: "attached",
        }),
    }
}

fn on_folder_changed(
    result: Result<String, RemoteError>,
    expected: FolderLocation,
    advance: Transition,
) -> Transition {
    match result {
        Ok(path) => {
            let actual = FolderLocation::from_path(&path);
            if actual == expected {
                advance
            } else {
                Transition::fail(SyncError::UnexpectedFolder { expected, actual })
            }
        }
        Err(source) => Transition::fail(SyncError::RemoteOperationFailed {
            operation: "change folder",
            source,
        }),
    }
}

/// The transport lists newest first, so the first entry is the candidate.
fn on_listing(items: Vec<FolderListingItem>, local: &LocalFileSet) -> Transition {
    let Some(newest) = items.into_iter().next() else {
        return Transition::fail(SyncError::EmptyRemoteListing);
    };

    if should_download(&newest, local) {
        Transition::to(
            Step::AwaitingRetrieval {
                name: newest.name.clone(),
            },
            vec![Command::GetFile(newest)],
        )
    } else {
        Transition::to(
            Step::Done(RunOutcome::Skipped { name: newest.name }),
            Vec::new(),
        )
    }
}
