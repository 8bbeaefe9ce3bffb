// src/watcher.rs
use crate::reload::ReloadFlag;
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info, trace};

/// Reasons the source directory could not be watched.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch directory does not exist: {}", .0.display())]
    NotFound(PathBuf),
    #[error("watch path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("failed to set up file watch: {0}")]
    Notify(#[from] notify::Error),
    #[error("failed to spawn change detector thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Watches one directory on a dedicated thread and raises a reload request
/// whenever a file in it has been written and closed.
///
/// The thread blocks on the watcher's channel. Dropping the watcher (done by
/// [`ChangeDetector::shutdown`] and on drop) disconnects that channel, so the
/// thread ends without waiting for another filesystem event.
pub struct ChangeDetector {
    dir: PathBuf,
    watcher: Option<RecommendedWatcher>,
    thread: Option<JoinHandle<()>>,
}

impl ChangeDetector {
    /// Starts watching `dir`.
    ///
    /// # Errors
    ///
    /// Fails if `dir` is missing or not a directory, if the platform watch
    /// cannot be installed, or if the thread cannot be spawned.
    pub fn spawn(dir: impl AsRef<Path>, flag: ReloadFlag) -> Result<Self, WatchError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            return Err(WatchError::NotFound(dir));
        }
        if !dir.is_dir() {
            return Err(WatchError::NotADirectory(dir));
        }

        // std channel: the receiving side is a plain thread, not a task.
        let (event_tx, event_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(event_tx)?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let thread = std::thread::Builder::new()
            .name("change-detector".to_string())
            .spawn(move || detect_changes(event_rx, flag))
            .map_err(WatchError::Spawn)?;

        info!("[ChangeDetector] Monitoring {}", dir.display());
        Ok(Self {
            dir,
            watcher: Some(watcher),
            thread: Some(thread),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stops watching and waits for the thread to finish.
    pub fn shutdown(mut self) {
        self.watcher.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("[ChangeDetector] Thread panicked");
            }
        }
        info!("[ChangeDetector] Stopped watching {}", self.dir.display());
    }
}

impl Drop for ChangeDetector {
    fn drop(&mut self) {
        // Disconnects the channel; the thread exits on its own.
        self.watcher.take();
    }
}

/// Event processing loop of the detector thread.
fn detect_changes(event_rx: Receiver<notify::Result<Event>>, flag: ReloadFlag) {
    while let Ok(result) = event_rx.recv() {
        match result {
            Ok(event) if is_completed_write(&event.kind) => {
                info!("[ChangeDetector] File changed: {:?}", event.paths);
                flag.request();
            }
            Ok(event) => {
                trace!("[ChangeDetector] Ignored {:?} for {:?}", event.kind, event.paths);
            }
            Err(e) => {
                error!("[ChangeDetector] Watch error: {}", e);
            }
        }
    }
    debug!("[ChangeDetector] Event channel closed, thread exiting.");
}

/// Whether an event marks a finished write rather than a chunk of one.
///
/// Close-after-write is only reported on Linux; elsewhere data modification
/// and file creation are the closest available signals.
pub fn is_completed_write(kind: &EventKind) -> bool {
    match kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
        | EventKind::Create(CreateKind::File) => !cfg!(target_os = "linux"),
        _ => false,
    }
}
