use std::{path::Path, time::SystemTime};

use courier_spool::QueueId;

use crate::{
    error::QmgrError,
    model::{DeliverFlags, RoutedRecipient},
};

/// A queue file as the queue manager needs it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedMessage {
    pub arrival: SystemTime,
    /// Recipients in queue-file order, already routed
    pub recipients: Vec<RoutedRecipient>,
}

/// The queue-file collaborator.
///
/// Parsing queue files and resolving addresses happen behind this trait. The
/// scheduler calls back into it to mark delivered or bounced recipients done
/// on disk and to hand a message back once nothing in core references it.
pub trait MessageSource: Send {
    /// Read a message that was just moved into the active queue
    ///
    /// # Errors
    ///
    /// Returns an error for an unreadable or corrupt queue file.
    fn load(&mut self, queue_id: &QueueId, path: &Path) -> Result<LoadedMessage, QmgrError>;

    /// Mark the recipient record at `offset` as done
    ///
    /// # Errors
    ///
    /// Returns an error if the queue file cannot be updated.
    fn mark_completed(&mut self, queue_id: &QueueId, offset: u64) -> Result<(), QmgrError>;

    /// The message left core. With [`DeliverFlags::DEFER`] set it must be
    /// kept for a later attempt, otherwise it is finished.
    fn release(&mut self, queue_id: &QueueId, flags: DeliverFlags);
}
