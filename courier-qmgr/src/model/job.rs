use ahash::AHashMap;

use super::{Entry, JobKey, MessageKey, PeerKey, QueueKey, TransportKey};
use crate::list::{Links, List};

/// The pairing of one message with one transport.
///
/// Jobs are served in transport order. A younger job may preempt the current
/// one by being stacked in front of it; the stack fields record that
/// relation and the slot accounting that pays for it.
pub struct Job {
    pub(crate) message: MessageKey,
    pub(crate) transport: TransportKey,
    pub(crate) peers: AHashMap<QueueKey, PeerKey>,
    pub(crate) peer_list: List<Peer>,
    pub(crate) stack_parent: Option<JobKey>,
    pub(crate) stack_children: u32,
    /// 0 for top level, `None` once retired from the job list
    pub(crate) stack_level: Option<u32>,
    pub(crate) slots_used: u32,
    pub(crate) slots_available: i64,
    /// Slots charged to the parent when this job was stacked
    pub(crate) slots_charged: i64,
    pub(crate) read_entries: u32,
    pub(crate) selected_entries: u32,
    /// Entries created and not yet selected or moved away
    pub(crate) todo_entries: u32,
    /// In-core recipients
    pub(crate) rcpt_count: u32,
    pub(crate) list_links: Links<Self>,
    pub(crate) bytime_links: Links<Self>,
}

impl Job {
    pub(crate) fn new(message: MessageKey, transport: TransportKey) -> Self {
        Self {
            message,
            transport,
            peers: AHashMap::new(),
            peer_list: List::default(),
            stack_parent: None,
            stack_children: 0,
            stack_level: Some(0),
            slots_used: 0,
            slots_available: 0,
            slots_charged: 0,
            read_entries: 0,
            selected_entries: 0,
            todo_entries: 0,
            rcpt_count: 0,
            list_links: Links::default(),
            bytime_links: Links::default(),
        }
    }

    pub const fn message(&self) -> MessageKey {
        self.message
    }

    pub const fn transport(&self) -> TransportKey {
        self.transport
    }

    pub const fn stack_parent(&self) -> Option<JobKey> {
        self.stack_parent
    }

    pub const fn stack_level(&self) -> Option<u32> {
        self.stack_level
    }

    pub const fn is_retired(&self) -> bool {
        self.stack_level.is_none()
    }

    pub const fn slots_available(&self) -> i64 {
        self.slots_available
    }

    pub const fn selected_entries(&self) -> u32 {
        self.selected_entries
    }

    pub const fn todo_entries(&self) -> u32 {
        self.todo_entries
    }

    pub fn peer(&self, queue: QueueKey) -> Option<PeerKey> {
        self.peers.get(&queue).copied()
    }
}

/// The pairing of one job with one destination queue
pub struct Peer {
    pub(crate) job: JobKey,
    pub(crate) queue: QueueKey,
    /// Waiting entries, oldest first
    pub(crate) entries: List<Entry>,
    pub(crate) refcount: u32,
    pub(crate) links: Links<Self>,
}

impl Peer {
    pub(crate) fn new(job: JobKey, queue: QueueKey) -> Self {
        Self {
            job,
            queue,
            entries: List::default(),
            refcount: 0,
            links: Links::default(),
        }
    }

    pub const fn job(&self) -> JobKey {
        self.job
    }

    pub const fn queue(&self) -> QueueKey {
        self.queue
    }

    pub const fn refcount(&self) -> u32 {
        self.refcount
    }
}
