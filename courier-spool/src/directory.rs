use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tracing::warn;

use crate::{config::SpoolConfig, error::Result, scan::ScanFlags};

/// One file discovered in a queue directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub name: String,
    pub path: PathBuf,
}

impl ScanEntry {
    /// Whether the file is ready to be picked up.
    ///
    /// Deferred files carry their next attempt time as modification time.
    /// A scan that ignores timestamps takes every file.
    ///
    /// # Errors
    ///
    /// Returns the error from reading the file metadata.
    pub fn is_due(&self, flags: ScanFlags, now: SystemTime) -> std::io::Result<bool> {
        if flags.contains(ScanFlags::IGNORE_TIMESTAMPS) {
            return Ok(true);
        }

        Ok(fs::metadata(&self.path)?.modified()? <= now)
    }
}

/// Source of queue directory listings
///
/// A cursor is opened per scan and dropped when the scan ends.
pub trait DirectorySource {
    type Cursor: Iterator<Item = ScanEntry>;

    /// Open a cursor over the named queue
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be listed.
    fn open(&self, queue: &str) -> Result<Self::Cursor>;
}

/// Queue directories on the local filesystem
#[derive(Debug, Clone)]
pub struct FsDirectory {
    config: SpoolConfig,
}

impl FsDirectory {
    pub const fn new(config: SpoolConfig) -> Self {
        Self { config }
    }
}

impl DirectorySource for FsDirectory {
    type Cursor = FsCursor;

    fn open(&self, queue: &str) -> Result<FsCursor> {
        let path = self.config.queue_path(queue)?;
        let listing = fs::read_dir(&path)?;
        Ok(FsCursor {
            stack: vec![listing],
        })
    }
}

/// Depth first walk of a queue directory.
///
/// Single character subdirectories are hash buckets and are descended into.
/// Dot files and other subdirectories are skipped.
#[derive(Debug)]
pub struct FsCursor {
    stack: Vec<fs::ReadDir>,
}

impl FsCursor {
    fn descend(&mut self, path: &Path) {
        match fs::read_dir(path) {
            Ok(listing) => self.stack.push(listing),
            Err(err) => warn!(path = %path.display(), "cannot open hash directory: {err}"),
        }
    }
}

impl Iterator for FsCursor {
    type Item = ScanEntry;

    fn next(&mut self) -> Option<ScanEntry> {
        loop {
            let Some(next) = self.stack.last_mut()?.next() else {
                self.stack.pop();
                continue;
            };

            let entry = match next {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("error reading queue directory: {err}");
                    continue;
                }
            };

            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };

            if name.starts_with('.') {
                continue;
            }

            let path = entry.path();
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => {
                    if name.len() == 1 {
                        self.descend(&path);
                    }
                }
                Ok(_) => return Some(ScanEntry { name, path }),
                Err(err) => warn!(path = %path.display(), "cannot stat queue entry: {err}"),
            }
        }
    }
}
