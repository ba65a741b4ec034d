use std::{
    fs::{self, File, FileTimes},
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use courier_common::internal;
use tracing::warn;

use crate::{
    config::SpoolConfig,
    directory::{DirectorySource, FsDirectory, ScanEntry},
    error::Result,
    types::QueueId,
};

/// Outcome of a bulk move
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveStats {
    pub moved: usize,
    /// Names that do not match the queue-ID grammar
    pub ignored: usize,
    /// Files removed by someone else while the move ran
    pub vanished: usize,
}

fn touch(path: &Path, when: SystemTime) -> io::Result<()> {
    File::open(path)?.set_times(FileTimes::new().set_accessed(when).set_modified(when))
}

/// Move every queue file from `src` to `dst`.
///
/// Files whose name is not a queue ID are left where they are. With `utime`
/// set, each file gets that access and modification time before it moves,
/// so that it is picked up as if it had just arrived. A file that disappears
/// halfway is reported and skipped.
///
/// # Errors
///
/// Returns an error if either queue cannot be opened or a rename fails for
/// any reason other than the file being gone.
///
/// # Panics
///
/// Panics if `src` and `dst` name the same queue.
pub fn move_queue(
    config: &SpoolConfig,
    src: &str,
    dst: &str,
    utime: Option<SystemTime>,
) -> Result<MoveStats> {
    assert_ne!(src, dst, "source queue is destination: {src}");

    let dst_dir = config.queue_path(dst)?;
    fs::create_dir_all(&dst_dir)?;

    let mut stats = MoveStats::default();

    for entry in FsDirectory::new(config.clone()).open(src)? {
        if !QueueId::is_valid(&entry.name) {
            warn!(queue = src, file = %entry.name, "ignored");
            stats.ignored += 1;
            continue;
        }

        if let Some(when) = utime {
            match touch(&entry.path, when) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    warn!(file = %entry.path.display(), "set file times: {err}");
                    stats.vanished += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        match fs::rename(&entry.path, dst_dir.join(&entry.name)) {
            Ok(()) => stats.moved += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(file = %entry.path.display(), "rename to {dst}: {err}");
                stats.vanished += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }

    internal!(
        level = INFO,
        "Moved {} files from {src} to {dst} ({} ignored, {} vanished)",
        stats.moved,
        stats.ignored,
        stats.vanished
    );

    Ok(stats)
}

/// Move a single scanned file into `dst`, returning its new path
///
/// # Errors
///
/// Returns an error if the destination is unknown or the rename fails.
pub fn move_entry(config: &SpoolConfig, entry: &ScanEntry, dst: &str) -> Result<PathBuf> {
    let target = config.queue_path(dst)?.join(&entry.name);
    fs::rename(&entry.path, &target)?;
    Ok(target)
}
