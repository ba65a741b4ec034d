use std::{
    collections::VecDeque,
    time::{Duration, SystemTime},
};

use ahash::AHashMap;
use bitflags::bitflags;
use courier_spool::QueueId;
use serde::{Deserialize, Serialize};

use super::{JobKey, TransportKey};

bitflags! {
    /// Delivery outcome flags accumulated on a message
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DeliverFlags: u8 {
        /// At least one recipient must be tried again later
        const DEFER = 1 << 0;
    }
}

/// One envelope recipient and its record offset in the queue file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub offset: u64,
    pub address: String,
    #[serde(default)]
    pub original: Option<String>,
}

impl Recipient {
    pub fn new(offset: u64, address: impl Into<String>) -> Self {
        Self {
            offset,
            address: address.into(),
            original: None,
        }
    }
}

/// A recipient already resolved to a transport and destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedRecipient {
    pub recipient: Recipient,
    pub transport: String,
    pub nexthop: String,
}

impl RoutedRecipient {
    pub fn new(recipient: Recipient, transport: &str, nexthop: &str) -> Self {
        Self {
            recipient,
            transport: transport.to_string(),
            nexthop: nexthop.to_string(),
        }
    }
}

/// In-core state of one queue file
pub struct Message {
    pub(crate) queue_id: QueueId,
    pub(crate) arrival: SystemTime,
    pub(crate) admitted_at: Duration,
    pub(crate) flags: DeliverFlags,
    pub(crate) override_defer: bool,
    /// Entries that still reference this message
    pub(crate) refcount: u32,
    /// Recipients not yet read in, in queue-file order
    pub(crate) unread: VecDeque<RoutedRecipient>,
    pub(crate) jobs: AHashMap<TransportKey, JobKey>,
    /// Whether the message waits for a recipient refill
    pub(crate) waiting: bool,
}

impl Message {
    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    pub const fn arrival(&self) -> SystemTime {
        self.arrival
    }

    pub const fn flags(&self) -> DeliverFlags {
        self.flags
    }

    pub const fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn unread(&self) -> usize {
        self.unread.len()
    }

    pub fn job(&self, transport: TransportKey) -> Option<JobKey> {
        self.jobs.get(&transport).copied()
    }

    /// No entries left and nothing left to read in
    pub(crate) fn is_finished(&self) -> bool {
        self.refcount == 0 && self.unread.is_empty()
    }
}
