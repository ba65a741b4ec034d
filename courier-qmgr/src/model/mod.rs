//! The scheduler's object graph.
//!
//! A [`Transport`] owns its destination [`Queue`]s and orders its [`Job`]s.
//! A [`Job`] pairs one [`Message`] with one transport and reaches each queue
//! through a [`Peer`]. An [`Entry`] is a batch of recipients of one message
//! for one queue, and sits both on that queue's todo or busy list and, while
//! waiting, on its peer's list.

mod entry;
mod job;
mod message;
mod queue;
mod transport;

pub use entry::{Entry, EntryState};
pub use job::{Job, Peer};
pub use message::{DeliverFlags, Message, Recipient, RoutedRecipient};
pub use queue::{Queue, Window};
pub use transport::Transport;

use crate::{arena::Key, list::Field};

pub type TransportKey = Key<Transport>;
pub type QueueKey = Key<Queue>;
pub type JobKey = Key<Job>;
pub type PeerKey = Key<Peer>;
pub type EntryKey = Key<Entry>;
pub type MessageKey = Key<Message>;

/// Round-robin order of all transports
pub(crate) const TRANSPORTS: Field<Transport> = Field::new(|t| &t.links, |t| &mut t.links);
/// A transport's queues
pub(crate) const QUEUES: Field<Queue> = Field::new(|q| &q.links, |q| &mut q.links);
/// A transport's scheduling order of jobs
pub(crate) const JOBS: Field<Job> = Field::new(|j| &j.list_links, |j| &mut j.list_links);
/// A transport's jobs by arrival
pub(crate) const JOBS_BY_TIME: Field<Job> =
    Field::new(|j| &j.bytime_links, |j| &mut j.bytime_links);
/// A job's peers
pub(crate) const PEERS: Field<Peer> = Field::new(|p| &p.links, |p| &mut p.links);
/// A queue's todo or busy list
pub(crate) const QUEUE_ENTRIES: Field<Entry> =
    Field::new(|e| &e.queue_links, |e| &mut e.queue_links);
/// A peer's waiting entries
pub(crate) const PEER_ENTRIES: Field<Entry> = Field::new(|e| &e.peer_links, |e| &mut e.peer_links);
