// Cleanup scheduler - deletes served files after a period of inactivity
//
// Every schedule/touch bumps a per-file generation and arms a fresh timer.
// A timer only deletes when, under the same lock, its generation is still
// the current one, so a file touched at the last moment is never removed by
// a timer that was already firing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::materializer::ATTEMPT_DIR_PREFIX;

/// Files kept by the startup sweep
const KEEP_FILES: &[&str] = &[".gitkeep"];

struct Pending {
    path: PathBuf,
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    next_generation: u64,
    pending: HashMap<String, Pending>,
}

#[derive(Clone)]
pub struct CleanupScheduler {
    storage_dir: PathBuf,
    delay: Duration,
    state: Arc<Mutex<State>>,
}

impl CleanupScheduler {
    pub fn new(storage_dir: impl Into<PathBuf>, delay: Duration) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            delay,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm (or re-arm) the deletion timer for a freshly written file
    pub fn schedule(&self, path: impl Into<PathBuf>, filename: &str) {
        self.arm(path.into(), filename);
        debug!(file = filename, delay_secs = self.delay.as_secs(), "cleanup scheduled");
    }

    /// Reset the timer of a file that was just accessed. Files we do not
    /// track (e.g. written before a restart) get tracked from now on.
    pub fn touch(&self, filename: &str) {
        let path = self.storage_dir.join(filename);
        self.arm(path, filename);
        debug!(file = filename, "cleanup timer reset");
    }

    /// Number of armed timers
    pub fn pending(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn is_pending(&self, filename: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.pending.contains_key(filename))
            .unwrap_or(false)
    }

    fn arm(&self, path: PathBuf, filename: &str) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        state.next_generation += 1;
        let generation = state.next_generation;

        let handle = tokio::spawn(expire(
            self.state.clone(),
            filename.to_string(),
            generation,
            self.delay,
        ));

        if let Some(previous) = state.pending.insert(
            filename.to_string(),
            Pending {
                path,
                generation,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Delete everything left in storage by a previous run, including attempt
    /// work dirs abandoned by a crash. Creates the directory when it does not
    /// exist yet. Returns the number of entries removed.
    pub async fn sweep(&self) -> std::io::Result<usize> {
        tokio::fs::create_dir_all(&self.storage_dir).await?;

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.storage_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if KEEP_FILES.contains(&name.as_str()) {
                continue;
            }
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(_) => continue,
            };
            if file_type.is_dir() && name.starts_with(ATTEMPT_DIR_PREFIX) {
                match tokio::fs::remove_dir_all(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(dir = %name, error = %e, "sweep could not remove work dir"),
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %name, error = %e, "sweep could not remove file"),
            }
        }

        info!(dir = %self.storage_dir.display(), removed, "startup sweep finished");
        Ok(removed)
    }
}

async fn expire(state: Arc<Mutex<State>>, filename: String, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;

    let mut state = match state.lock() {
        Ok(state) => state,
        Err(poisoned) => poisoned.into_inner(),
    };
    match state.pending.get(&filename) {
        Some(p) if p.generation == generation => {}
        // superseded by a later touch
        _ => return,
    }
    // Delete while holding the lock so a concurrent touch either lands
    // before (and wins) or after (and re-tracks a missing file)
    if let Some(p) = state.pending.remove(&filename) {
        delete_file(&p.path);
    }
}

/// Best-effort, idempotent delete
fn delete_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "expired file deleted"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "expired file already gone");
        }
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete expired file"),
    }
}
