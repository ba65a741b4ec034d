//! Final and temporary dispositions of recipients.
//!
//! Bounced and deferred recipients are appended to per-message logs, one
//! `ron` record per line, from which notices are generated later. Deferral
//! of whole queues and transports either reroutes their waiting entries to
//! the retry service or defers every recipient in them.

use std::{
    fs::OpenOptions,
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use courier_common::{Dsn, scheduler};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::LogError,
    list::List,
    model::{
        DeliverFlags, EntryState, MessageKey, QUEUE_ENTRIES, QUEUES, QueueKey, Recipient,
        TransportKey,
    },
    scheduler::Scheduler,
};

/// One recipient's line in a bounce or defer log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub queue_id: String,
    pub recipient: String,
    pub original: Option<String>,
    pub offset: u64,
    pub relay: String,
    pub status: String,
    pub reason: String,
    pub arrival: DateTime<Utc>,
    pub logged_at: DateTime<Utc>,
}

/// Append-only storage of recipient dispositions
pub trait RecipientLog: Send {
    /// # Errors
    ///
    /// Returns [`LogError`] if the record could not be stored.
    fn append(&mut self, record: &LogRecord) -> Result<(), LogError>;
}

/// A directory of per-message log files named by queue ID
#[derive(Debug, Clone)]
pub struct FileRecipientLog {
    dir: PathBuf,
}

impl FileRecipientLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Every record logged for `queue_id`, oldest first
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the log cannot be read or holds a malformed line.
    pub fn records(&self, queue_id: &str) -> Result<Vec<LogRecord>, LogError> {
        let file = std::fs::File::open(self.dir.join(queue_id))?;
        BufReader::new(file)
            .lines()
            .map(|line| Ok(ron::from_str(&line?)?))
            .collect()
    }
}

impl RecipientLog for FileRecipientLog {
    fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let line = ron::ser::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(&record.queue_id))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl<S> Scheduler<S> {
    fn log_record(&self, message: MessageKey, recipient: &Recipient, dsn: &Dsn) -> LogRecord {
        let message = &self.messages[message];
        LogRecord {
            queue_id: message.queue_id.to_string(),
            recipient: recipient.address.clone(),
            original: recipient.original.clone(),
            offset: recipient.offset,
            relay: "none".to_string(),
            status: dsn.status().to_string(),
            reason: dsn.reason().to_string(),
            arrival: message.arrival.into(),
            logged_at: SystemTime::now().into(),
        }
    }

    /// Record a permanent failure and mark the recipient done. If either step
    /// fails the message is kept for another attempt instead.
    pub fn bounce_recipient(&mut self, message: MessageKey, recipient: &Recipient, dsn: &Dsn) {
        let record = self.log_record(message, recipient, dsn);
        debug!(queue_id = %record.queue_id, recipient = %record.recipient, "bounced: {dsn}");

        let result = self.bounce_log.append(&record).map_err(Into::into).and_then(|()| {
            self.source
                .mark_completed(&self.messages[message].queue_id, recipient.offset)
        });
        if let Err(err) = result {
            warn!(queue_id = %record.queue_id, "cannot bounce {}: {err}", record.recipient);
            self.messages[message].flags |= DeliverFlags::DEFER;
        }
    }

    /// Record a temporary failure. The message stays in the queue.
    pub fn defer_recipient(&mut self, message: MessageKey, recipient: &Recipient, dsn: &Dsn) {
        let record = self.log_record(message, recipient, dsn);
        debug!(queue_id = %record.queue_id, recipient = %record.recipient, "deferred: {dsn}");

        if let Err(err) = self.defer_log.append(&record) {
            warn!(
                queue_id = %record.queue_id,
                "cannot log deferral of {}: {err}",
                record.recipient
            );
        }
        self.messages[message].flags |= DeliverFlags::DEFER;
    }

    /// Dispose of every waiting entry of a queue: reroute it to the retry
    /// service's queue for `dsn`, or when that is unavailable defer each of
    /// its recipients.
    ///
    /// # Panics
    ///
    /// Panics if `dsn` is not a temporary failure.
    pub fn defer_todo(&mut self, queue: QueueKey, dsn: &Dsn) {
        assert!(dsn.is_temporary(), "queue-wide deferral with status {dsn}");
        if self.queues[queue].todo.is_empty() {
            return;
        }

        let service = self.config.retry_service.clone();
        let retry = self.error_queue(&service, dsn).filter(|retry| *retry != queue);
        scheduler!(
            "deferring {} entries of {}: {dsn}",
            self.queues[queue].todo_refcount,
            self.queues[queue].nexthop
        );

        let mut cursor = self.queues[queue].todo.front();
        while let Some(entry) = cursor {
            cursor = List::next_of(&self.entries, entry, QUEUE_ENTRIES);

            if let Some(retry) = retry {
                self.entry_move_todo(retry, entry);
                continue;
            }

            let message = self.entries[entry].message;
            let recipients = self.entries[entry].recipients.clone();
            for recipient in &recipients {
                self.defer_recipient(message, recipient, dsn);
            }
            self.entry_done(entry, EntryState::Todo);
        }
    }

    /// [`defer_todo`](Self::defer_todo) for every queue of a transport
    pub fn defer_transport(&mut self, transport: TransportKey, dsn: &Dsn) {
        let mut cursor = self.transports[transport].queue_list.front();
        while let Some(queue) = cursor {
            cursor = List::next_of(&self.queues, queue, QUEUES);
            self.defer_todo(queue, dsn);
        }
    }
}
