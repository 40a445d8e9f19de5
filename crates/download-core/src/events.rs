//! In-process notifications produced by the download controller.
//!
//! `EventBus` delivers `DownloadEvent`s to subscribers on the caller's thread.
//! Wrap it in `Arc` to subscribe; dropping the returned `Subscription` unsubscribes.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Fixed identifier of the "new file saved" notification.
pub const SAVED_NEW_FILE: &str = "download.saved_new_file";

/// Notifications for the rest of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DownloadEvent {
    /// A new file from the device landed in local storage. Carries no payload.
    SavedNewFile,
}

impl DownloadEvent {
    pub fn id(&self) -> &'static str {
        match self {
            DownloadEvent::SavedNewFile => SAVED_NEW_FILE,
        }
    }
}

type Callback = Arc<dyn Fn(DownloadEvent) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Fire-and-forget event bus.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(DownloadEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: DownloadEvent) {
        // No lock is held while callbacks run; they may subscribe or unsubscribe
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(bus: &Arc<EventBus>) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });
        (count, sub)
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let (count, _sub) = counter(&bus);

        bus.emit(DownloadEvent::SavedNewFile);

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let (count, sub) = counter(&bus);
        let (other, _other_sub) = counter(&bus);

        bus.emit(DownloadEvent::SavedNewFile);
        drop(sub);
        bus.emit(DownloadEvent::SavedNewFile);

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(other.load(Ordering::Relaxed), 2);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_callback_may_drop_a_subscription() {
        let bus = Arc::new(EventBus::new());
        let (count, sub) = counter(&bus);
        let held = Arc::new(std::sync::Mutex::new(Some(sub)));

        let held_clone = Arc::clone(&held);
        let _dropper = bus.subscribe(move |_event| {
            held_clone.lock().unwrap().take();
        });

        bus.emit(DownloadEvent::SavedNewFile);
        bus.emit(DownloadEvent::SavedNewFile);

        assert!(held.lock().unwrap().is_none());
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_saved_new_file_has_fixed_id() {
        assert_eq!(DownloadEvent::SavedNewFile.id(), "download.saved_new_file");

        let json = serde_json::to_string(&DownloadEvent::SavedNewFile).unwrap();
        assert_eq!(json, "{\"type\":\"savedNewFile\"}");
    }
}
