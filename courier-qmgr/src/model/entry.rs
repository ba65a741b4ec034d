use super::{MessageKey, PeerKey, QueueKey, Recipient};
use crate::list::Links;

/// Which of its queue's lists an entry is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting for a delivery agent
    Todo,
    /// Handed to a delivery agent
    Busy,
}

/// A batch of recipients of one message for one destination
pub struct Entry {
    pub(crate) message: MessageKey,
    pub(crate) queue: QueueKey,
    pub(crate) peer: PeerKey,
    pub(crate) recipients: Vec<Recipient>,
    pub(crate) state: EntryState,
    pub(crate) queue_links: Links<Self>,
    pub(crate) peer_links: Links<Self>,
}

impl Entry {
    pub(crate) fn new(message: MessageKey, queue: QueueKey, peer: PeerKey) -> Self {
        Self {
            message,
            queue,
            peer,
            recipients: Vec::new(),
            state: EntryState::Todo,
            queue_links: Links::default(),
            peer_links: Links::default(),
        }
    }

    pub const fn message(&self) -> MessageKey {
        self.message
    }

    pub const fn queue(&self) -> QueueKey {
        self.queue
    }

    pub const fn peer(&self) -> PeerKey {
        self.peer
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    pub const fn state(&self) -> EntryState {
        self.state
    }
}
