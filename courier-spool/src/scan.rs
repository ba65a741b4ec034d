use bitflags::bitflags;
use courier_common::internal;

use crate::{directory::DirectorySource, directory::ScanEntry, error::Result};

bitflags! {
    /// Scan control flags
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ScanFlags: u8 {
        /// Take files regardless of their modification time
        const IGNORE_TIMESTAMPS = 1 << 0;
        /// Deliver even to transports listed in `defer_transports`
        const OVERRIDE_DEFER_TRANSPORTS = 1 << 1;
        /// Forget every dead transport and throttled queue before scanning
        const FLUSH_DEAD = 1 << 2;
    }
}

/// Restartable scan of one queue directory
///
/// The scan is either idle or walking the directory. A request that arrives
/// while a scan is running never interrupts it: it is remembered, and a new
/// scan starts as soon as the current one has handed out its last file.
/// Several requests during one scan still produce a single follow-up scan.
pub struct QueueScan<D: DirectorySource> {
    queue: String,
    source: D,
    cursor: Option<D::Cursor>,
    flags: ScanFlags,
    next_flags: ScanFlags,
    restart: bool,
}

impl<D: DirectorySource> QueueScan<D> {
    pub fn new(source: D, queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            source,
            cursor: None,
            flags: ScanFlags::empty(),
            next_flags: ScanFlags::empty(),
            restart: false,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub const fn is_scanning(&self) -> bool {
        self.cursor.is_some()
    }

    pub const fn restart_pending(&self) -> bool {
        self.restart
    }

    /// Flags of the scan in progress
    pub const fn flags(&self) -> ScanFlags {
        self.flags
    }

    /// Ask for a scan.
    ///
    /// When idle the scan starts now. Otherwise the timestamp and
    /// defer-transport overrides also apply to the remainder of the running
    /// scan, and every flag is kept for the follow-up scan.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue directory cannot be opened.
    pub fn request(&mut self, flags: ScanFlags) -> Result<()> {
        if self.cursor.is_none() {
            return self.start(flags);
        }

        for retroactive in [
            ScanFlags::IGNORE_TIMESTAMPS,
            ScanFlags::OVERRIDE_DEFER_TRANSPORTS,
        ] {
            if flags.contains(retroactive) {
                self.flags |= retroactive;
            }
        }

        self.next_flags |= flags;
        self.restart = true;

        Ok(())
    }

    fn start(&mut self, flags: ScanFlags) -> Result<()> {
        internal!("Scanning queue {}", self.queue);
        self.cursor = Some(self.source.open(&self.queue)?);
        self.flags = flags;
        Ok(())
    }

    /// Next file of the scan, or `None` once the scan (and any requested
    /// follow-up scan) is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if a follow-up scan cannot open the directory.
    #[allow(
        clippy::should_implement_trait,
        reason = "Opening a follow-up scan can fail, which Iterator cannot express"
    )]
    pub fn next(&mut self) -> Result<Option<ScanEntry>> {
        loop {
            let Some(cursor) = self.cursor.as_mut() else {
                return Ok(None);
            };

            if let Some(entry) = cursor.next() {
                return Ok(Some(entry));
            }

            self.cursor = None;
            self.flags = ScanFlags::empty();

            if !self.restart {
                internal!("Scan of queue {} complete", self.queue);
                return Ok(None);
            }

            self.restart = false;
            let flags = std::mem::take(&mut self.next_flags);
            self.start(flags)?;
        }
    }
}
