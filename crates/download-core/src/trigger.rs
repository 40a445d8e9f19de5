//! Events that may start a download run.

use crate::transport::ConnectionState;

/// Hardware button on the handheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    /// The button that saves the current page
    Save,
    /// Any other button, by device id
    Other(u32),
}

/// External signal consumed once by `SyncController::on_trigger`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    ButtonPressed(Button),
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl TriggerEvent {
    /// Whether this event asks for a download run.
    ///
    /// Only the save button and a fresh Connecting -> Connected transition qualify.
    pub fn starts_run(&self) -> bool {
        match self {
            TriggerEvent::ButtonPressed(button) => *button == Button::Save,
            TriggerEvent::ConnectionStateChanged { from, to } => {
                *from == ConnectionState::Connecting && *to == ConnectionState::Connected
            }
        }
    }
}
