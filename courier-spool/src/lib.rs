//! Queue directory layer
//!
//! Named queue directories under a spool root, the queue-ID grammar that
//! decides which files belong to the queue manager, a restartable directory
//! scanner and the bulk mover.

pub mod config;
pub mod directory;
pub mod error;
pub mod mover;
pub mod scan;
pub mod types;

pub use config::{SpoolConfig, queues};
pub use directory::{DirectorySource, FsDirectory, ScanEntry};
pub use error::{Result, SpoolError, ValidationError};
pub use mover::{MoveStats, move_entry, move_queue};
pub use scan::{QueueScan, ScanFlags};
pub use types::QueueId;
