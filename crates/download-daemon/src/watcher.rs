//! Watches the device's `SAVED` folder and presses Save when a page lands.
//!
//! Uses notify-debouncer-mini, so one save that touches a file several times
//! becomes a single trigger.

use anyhow::{Context, Result};
use download_core::trigger::{Button, TriggerEvent};
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Last seen mtime per file name, to drop events that changed nothing
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

pub struct SaveFolderWatcher {
    saved_dir: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

impl SaveFolderWatcher {
    /// Watch `saved_dir`, sending `ButtonPressed(Save)` on `triggers` for each
    /// debounced batch that contains a new or rewritten page.
    pub fn new(saved_dir: PathBuf, triggers: mpsc::UnboundedSender<TriggerEvent>) -> Result<Self> {
        // FSEvents needs the real path (/var vs /private/var on macOS)
        let saved_dir = saved_dir.canonicalize().unwrap_or(saved_dir);
        let watched = saved_dir.clone();

        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let pages = events
                        .iter()
                        .filter(|event| is_new_page(&event.path, &watched, &mtime_cache))
                        .count();
                    if pages > 0 {
                        debug!("{} page(s) saved on device, pressing Save", pages);
                        let _ = triggers.send(TriggerEvent::ButtonPressed(Button::Save));
                    }
                }
                Err(e) => {
                    error!("Save folder watcher error: {}", e);
                }
            },
        )
        .context("Failed to create save folder watcher")?;

        debouncer
            .watcher()
            .watch(&saved_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", saved_dir.display()))?;

        Ok(Self {
            saved_dir,
            _debouncer: debouncer,
        })
    }

    pub fn saved_dir(&self) -> &Path {
        &self.saved_dir
    }
}

/// A visible regular file directly inside the folder whose mtime moved.
fn is_new_page(path: &Path, saved_dir: &Path, mtime_cache: &MtimeCache) -> bool {
    let Ok(relative) = path.strip_prefix(saved_dir) else {
        return false;
    };
    let Some(name) = relative.to_str() else {
        return false;
    };
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return false;
    }

    let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
    let mtime = match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata.modified().ok(),
        _ => {
            cache.remove(relative);
            return false;
        }
    };

    match mtime {
        Some(mtime) => cache.insert(relative.to_path_buf(), mtime) != Some(mtime),
        None => true,
    }
}
