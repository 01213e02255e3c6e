//! # Last-Value Store
//!
//! Persists exactly one line, the most recent decoded reading, to a fixed file name inside
//! the configured output folder. Consumers poll that file, so it must never be observed
//! half-written:
//!
//! 1. free space on the target volume is checked first; below the floor the write is
//!    skipped and reported as [`WriteOutcome::Paused`] (losing a reading beats filling
//!    the disk);
//! 2. content goes to a uniquely named temp file in the same folder and is fsynced;
//! 3. the temp file is renamed over the target, which is atomic on the same volume;
//! 4. I/O failures are retried a few times with a short linear backoff.
//!
//! There is no history and no append: every write fully replaces the previous value.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

/// Fixed name of the last-value file inside the output folder.
pub const LAST_VALUE_FILE_NAME: &str = "lastvalue.txt";

/// Default free-space floor (50 MiB).
pub const DEFAULT_MIN_FREE_BYTES: u64 = 50 * 1024 * 1024;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot prepare output folder {path}: {source}")]
    Folder {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write to {path} failed after {attempts} attempt(s): {source}")]
    Write {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Not enough free space; nothing was written.
    Paused { available: u64, required: u64 },
}

#[derive(Debug, Clone)]
pub struct StorePolicy {
    pub min_free_bytes: u64,
    /// Total attempts per write, including the first.
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            attempts: 3,
            retry_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LastValueStore {
    path: PathBuf,
    policy: StorePolicy,
}

impl LastValueStore {
    pub fn new(output_dir: impl AsRef<Path>, policy: StorePolicy) -> Self {
        Self {
            path: output_dir.as_ref().join(LAST_VALUE_FILE_NAME),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn folder(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Replace the stored value with `line` (a trailing newline is appended, no BOM).
    pub fn write(&self, line: &str) -> Result<WriteOutcome, StoreError> {
        let folder = self.folder();
        fs::create_dir_all(folder).map_err(|source| StoreError::Folder {
            path: folder.to_path_buf(),
            source,
        })?;

        match fs2::available_space(folder) {
            Ok(available) if available < self.policy.min_free_bytes => {
                return Ok(WriteOutcome::Paused {
                    available,
                    required: self.policy.min_free_bytes,
                });
            }
            Ok(_) => {}
            // Some filesystems (network shares, containers) cannot report space; write anyway
            Err(e) => debug!("Free space query for {} failed: {}", folder.display(), e),
        }

        let mut content = String::with_capacity(line.len() + 1);
        content.push_str(line);
        content.push('\n');

        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match replace_atomically(&self.path, content.as_bytes()) {
                Ok(()) => return Ok(WriteOutcome::Written),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Write to {} failed (attempt {}/{}): {}",
                        self.path.display(),
                        attempt,
                        attempts,
                        e
                    );
                    std::thread::sleep(self.policy.retry_delay * attempt);
                }
                Err(source) => {
                    return Err(StoreError::Write {
                        path: self.path.clone(),
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Current stored line without its newline, `None` if nothing was written yet.
    pub fn read(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(s.trim_end_matches(['\r', '\n']).to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn replace_atomically(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(LAST_VALUE_FILE_NAME);

    let tmp_path = loop {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), n));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut tmp) => {
                let written = tmp
                    .write_all(content)
                    .and_then(|_| tmp.flush())
                    .and_then(|_| tmp.sync_all());
                if let Err(e) = written {
                    drop(tmp);
                    let _ = fs::remove_file(&candidate);
                    return Err(e);
                }
                break candidate;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    };

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    // Persist the rename itself (best-effort; not supported on every platform)
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}
