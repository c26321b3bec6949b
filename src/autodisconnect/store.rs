//! Durable auto-disconnect expiry flag
//!
//! The expiry flag is the one piece of state shared across process
//! boundaries: the timer writes it at expiry and the controlling
//! application reads it on its next launch, even if this process was killed
//! in between. Writes go through a temp file in the same directory followed
//! by `fsync` and an atomic rename, so a racing reader sees either the old
//! state or the new one, never a torn write.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

/// File-backed durable expiry flag
///
/// The file content is the expiry timestamp in milliseconds since the Unix
/// epoch, as ASCII decimal. An absent file means "not expired".
#[derive(Debug, Clone)]
pub struct ExpiryFlagStore {
    path: PathBuf,
}

impl ExpiryFlagStore {
    /// Create a store at the given path
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The flag file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably record that auto-disconnect fired now
    ///
    /// The write is complete (synced and renamed into place) before this
    /// returns; the session may be torn down immediately afterwards without
    /// risking flag loss.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; callers treat a failed persist as
    /// fatal for the expiry path because a silent loss would leave the
    /// controlling application unaware of the disconnect.
    pub fn mark_expired(&self) -> std::io::Result<()> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.write_timestamp(now_ms)
    }

    fn write_timestamp(&self, timestamp_ms: u64) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            write!(file, "{timestamp_ms}")?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        info!(path = %self.path.display(), timestamp_ms, "expiry flag persisted");
        Ok(())
    }

    /// Read the persisted expiry timestamp, if set
    ///
    /// Absent or unreadable files read as "not expired".
    #[must_use]
    pub fn expired_at_ms(&self) -> Option<u64> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        let ts: u64 = contents.trim().parse().ok()?;
        (ts > 0).then_some(ts)
    }

    /// Whether the flag is set
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.expired_at_ms().is_some()
    }

    /// Clear the flag
    ///
    /// Called explicitly by the controlling application once it has observed
    /// the expiry; never cleared implicitly.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; a missing file is not an error.
    pub fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "expiry flag cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
