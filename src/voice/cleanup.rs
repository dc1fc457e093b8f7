//! Deferred deletion of synthesized clips
//!
//! Some output drivers still hold a file briefly after playback ends, so
//! clips can be queued here and removed after a delay. The same thread
//! periodically sweeps stale `tts_*` files left behind by crashes.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{RecvTimeoutError, Sender};

/// Prefix of files the sweeper may delete
pub const CLIP_PREFIX: &str = "tts_";

/// Cleanup thread settings
#[derive(Debug, Clone)]
pub struct CleanupSettings {
    /// Delay before a queued file is removed
    pub delay: Duration,
    /// Directory swept for stale clips
    pub sweep_dir: Option<PathBuf>,
    /// Age after which a clip counts as stale
    pub retention: Duration,
    /// Spacing between sweeps
    pub sweep_interval: Duration,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            sweep_dir: None,
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

enum Message {
    Delete(PathBuf),
    Shutdown,
}

/// Handle to the cleanup thread
pub struct CleanupQueue {
    sender: Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CleanupQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupQueue").finish_non_exhaustive()
    }
}

impl CleanupQueue {
    /// Spawn the cleanup thread
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn start(settings: CleanupSettings) -> crate::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();

        let handle = std::thread::Builder::new()
            .name("parley-cleanup".to_string())
            .spawn(move || {
                let mut pending: Vec<(Instant, PathBuf)> = Vec::new();
                let mut next_sweep = Instant::now();

                loop {
                    if let Some(dir) = &settings.sweep_dir {
                        if Instant::now() >= next_sweep {
                            sweep_stale(dir, settings.retention);
                            next_sweep = Instant::now() + settings.sweep_interval;
                        }
                    }

                    let mut wake = pending.iter().map(|(due, _)| *due).min();
                    if settings.sweep_dir.is_some() {
                        wake = Some(wake.map_or(next_sweep, |due| due.min(next_sweep)));
                    }
                    let wait = wake.map_or(settings.sweep_interval, |at| {
                        at.saturating_duration_since(Instant::now())
                    });

                    match receiver.recv_timeout(wait) {
                        Ok(Message::Delete(path)) => {
                            pending.push((Instant::now() + settings.delay, path));
                        }
                        Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            for (_, path) in pending.drain(..) {
                                remove_quietly(&path);
                            }
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                    }

                    let now = Instant::now();
                    pending.retain(|(due, path)| {
                        if *due <= now {
                            remove_quietly(path);
                            false
                        } else {
                            true
                        }
                    });
                }

                tracing::debug!("cleanup thread stopped");
            })?;

        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a file for delayed deletion
    pub fn schedule(&self, path: PathBuf) {
        if let Err(e) = self.sender.send(Message::Delete(path)) {
            // thread already gone: delete inline
            if let Message::Delete(path) = e.into_inner() {
                remove_quietly(&path);
            }
        }
    }

    /// Delete everything still queued and stop the thread
    pub fn shutdown(&self) {
        let _ = self.sender.send(Message::Shutdown);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("cleanup thread panicked");
            }
        }
    }
}

impl Drop for CleanupQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::trace!(path = %path.display(), "temp file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove temp file"),
    }
}

/// Delete `tts_*` files in `dir` older than `retention`
///
/// Returns how many files were removed.
pub fn sweep_stale(dir: &Path, retention: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        let is_clip = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(CLIP_PREFIX));
        if !is_clip {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= retention);
        if stale && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "stale clips swept");
    }
    removed
}
