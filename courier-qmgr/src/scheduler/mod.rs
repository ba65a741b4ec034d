//! The in-core scheduler.
//!
//! [`Scheduler`] owns every transport, queue, job, peer, entry and message,
//! plus the timers that move them between states. It is driven from a single
//! task: the service feeds it messages, connection completions, delivery
//! reports and timer ticks, and it decides which transport connects next and
//! which entry a fresh connection carries.
//!
//! The operations are split over several files by concern, all as
//! `impl Scheduler` blocks:
//!
//! * `connection`: transport selection, allocation and throttling
//! * `window`: queue window state changes
//! * `jobs`: admission, entry bookkeeping, entry selection and preemption
//! * `delivery`: delivery requests and their outcomes

mod connection;
mod delivery;
mod jobs;
mod window;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use ahash::AHashMap;
use courier_common::scheduler;
use tracing::warn;

pub use connection::PIPELINE_DEPTH;
pub use delivery::{AgentStatus, DeliveryReport, DeliveryRequest, RecipientStatus};
pub use jobs::Admission;

use crate::{
    arena::Arena,
    clock::Clock,
    config::{QmgrConfig, TransportSettings},
    connect::{AllocId, Connector},
    disposition::RecipientLog,
    error::QmgrError,
    list::List,
    model::{
        Entry, EntryKey, Job, JobKey, Message, MessageKey, Peer, PeerKey, QUEUES, Queue,
        QueueKey, TRANSPORTS, Transport, TransportKey, Window,
    },
    source::MessageSource,
    timer::{TimerKey, TimerTable},
};

/// Completion callback of a connection request.
///
/// Called with the connected stream, or with `None` when the connection
/// could not be made.
pub type Notify<S> = Box<dyn FnOnce(&mut Scheduler<S>, TransportKey, Option<S>) + Send>;

struct Allocation<S> {
    transport: TransportKey,
    notify: Notify<S>,
    /// A connected stream held back by a transport rate delay
    stream: Option<S>,
}

/// Everything the scheduler talks to outside its own memory
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub connector: Box<dyn Connector>,
    pub source: Box<dyn MessageSource>,
    pub bounce_log: Box<dyn RecipientLog>,
    pub defer_log: Box<dyn RecipientLog>,
}

pub struct Scheduler<S> {
    pub(crate) config: QmgrConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) connector: Box<dyn Connector>,
    pub(crate) source: Box<dyn MessageSource>,
    pub(crate) bounce_log: Box<dyn RecipientLog>,
    pub(crate) defer_log: Box<dyn RecipientLog>,

    pub(crate) transports: Arena<Transport>,
    pub(crate) transport_list: List<Transport>,
    pub(crate) transport_by_name: AHashMap<String, TransportKey>,
    pub(crate) queues: Arena<Queue>,
    pub(crate) jobs: Arena<Job>,
    pub(crate) peers: Arena<Peer>,
    pub(crate) entries: Arena<Entry>,
    pub(crate) messages: Arena<Message>,
    /// Messages with recipients left to read once in-core limits allow
    pub(crate) waiting: VecDeque<MessageKey>,

    pub(crate) timers: TimerTable<TimerKey>,
    allocs: AHashMap<AllocId, Allocation<S>>,
    next_alloc: u64,
}

impl<S> Scheduler<S> {
    /// Create an empty scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`QmgrError::Config`] if any transport's settings are invalid.
    pub fn new(config: QmgrConfig, parts: Collaborators) -> Result<Self, QmgrError> {
        config.validate()?;

        Ok(Self {
            config,
            clock: parts.clock,
            connector: parts.connector,
            source: parts.source,
            bounce_log: parts.bounce_log,
            defer_log: parts.defer_log,
            transports: Arena::new(),
            transport_list: List::default(),
            transport_by_name: AHashMap::new(),
            queues: Arena::new(),
            jobs: Arena::new(),
            peers: Arena::new(),
            entries: Arena::new(),
            messages: Arena::new(),
            waiting: VecDeque::new(),
            timers: TimerTable::default(),
            allocs: AHashMap::new(),
            next_alloc: 0,
        })
    }

    pub const fn config(&self) -> &QmgrConfig {
        &self.config
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub const fn timers(&self) -> &TimerTable<TimerKey> {
        &self.timers
    }

    /// Earliest armed timer
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    pub fn source_mut(&mut self) -> &mut dyn MessageSource {
        self.source.as_mut()
    }

    /// The transport called `name`, created with its resolved settings on
    /// first reference.
    pub fn obtain_transport(&mut self, name: &str) -> TransportKey {
        if let Some(key) = self.find_transport(name) {
            return key;
        }

        let settings = TransportSettings::resolve(&self.config, name)
            .unwrap_or_else(|err| panic!("transport {name} has invalid settings: {err}"));
        let key = self
            .transports
            .insert(Transport::new(name, settings, self.clock.now()));
        self.transport_list
            .push_back(&mut self.transports, key, TRANSPORTS);
        self.transport_by_name.insert(name.to_string(), key);

        scheduler!("new transport {name}");
        key
    }

    pub fn find_transport(&self, name: &str) -> Option<TransportKey> {
        self.transport_by_name.get(name).copied()
    }

    pub fn transport(&self, key: TransportKey) -> Option<&Transport> {
        self.transports.get(key)
    }

    /// Transports in their current round-robin order
    pub fn transport_keys(&self) -> Vec<TransportKey> {
        self.transport_list
            .iter(&self.transports, TRANSPORTS)
            .collect()
    }

    /// The queue for `nexthop` on `transport`, created ready on first reference.
    pub fn obtain_queue(&mut self, transport: TransportKey, nexthop: &str) -> QueueKey {
        if let Some(key) = self.find_queue(transport, nexthop) {
            return key;
        }

        let owner = &self.transports[transport];
        let key = self
            .queues
            .insert(Queue::new(nexthop, transport, &owner.settings));
        let owner = &mut self.transports[transport];
        owner.queue_list.push_back(&mut self.queues, key, QUEUES);
        owner.queues.insert(nexthop.to_string(), key);

        scheduler!("new queue {nexthop} on {}", owner.name);
        key
    }

    pub fn find_queue(&self, transport: TransportKey, nexthop: &str) -> Option<QueueKey> {
        self.transports
            .get(transport)?
            .queues
            .get(nexthop)
            .copied()
    }

    pub fn queue(&self, key: QueueKey) -> Option<&Queue> {
        self.queues.get(key)
    }

    /// Queues of `transport` in their current round-robin order
    pub fn queue_keys(&self, transport: TransportKey) -> Vec<QueueKey> {
        self.transports[transport]
            .queue_list
            .iter(&self.queues, QUEUES)
            .collect()
    }

    /// Destroy an empty, ready queue.
    ///
    /// # Panics
    ///
    /// Panics if the queue still holds entries, is not ready, or carries a
    /// throttle reason.
    pub(crate) fn queue_done(&mut self, key: QueueKey) {
        let queue = &self.queues[key];
        assert!(
            queue.is_empty() && queue.todo_refcount == 0 && queue.busy_refcount == 0,
            "queue {} is not empty",
            queue.nexthop
        );
        assert!(
            queue.window.is_ready(),
            "queue {} is not ready: {}",
            queue.nexthop,
            queue.window
        );
        assert!(queue.dsn.is_none(), "queue {} still has a reason", queue.nexthop);

        let owner = queue.transport;
        let transport = &mut self.transports[owner];
        transport.queue_list.unlink(&mut self.queues, key, QUEUES);
        let queue = self.queues.remove(key);
        transport.queues.remove(&queue.nexthop);

        scheduler!("queue {} on {} done", queue.nexthop, transport.name);
    }

    /// Destroy `key` if nothing references it and its window allows it
    pub(crate) fn queue_collect(&mut self, key: QueueKey) {
        let queue = &self.queues[key];
        if queue.window.is_ready() && queue.is_empty() {
            self.queue_done(key);
        }
    }

    pub fn job(&self, key: JobKey) -> Option<&Job> {
        self.jobs.get(key)
    }

    pub fn peer(&self, key: PeerKey) -> Option<&Peer> {
        self.peers.get(key)
    }

    pub fn entry(&self, key: EntryKey) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn message(&self, key: MessageKey) -> Option<&Message> {
        self.messages.get(key)
    }

    /// Messages currently in core
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Fire every timer whose deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns [`QmgrError::ConnectTimeout`] when a delivery agent accepted a
    /// connection request and never completed it. The caller must stop.
    pub fn run_timers(&mut self) -> Result<(), QmgrError> {
        let now = self.clock.now();

        while let Some(timer) = self.timers.pop_due(now) {
            match timer {
                TimerKey::ConnectWatchdog(alloc) => {
                    let transport = self
                        .allocs
                        .get(&alloc)
                        .and_then(|a| self.transports.get(a.transport))
                        .map_or_else(|| alloc.to_string(), |t| t.name.clone());
                    return Err(QmgrError::ConnectTimeout { transport });
                }
                TimerKey::ConnectFailed(alloc) => {
                    if let Some(allocation) = self.allocs.get(&alloc) {
                        self.transports[allocation.transport].pending -= 1;
                    }
                    self.finish_alloc(alloc, None);
                }
                TimerKey::RateDelay(alloc) => {
                    let Some(allocation) = self.allocs.get_mut(&alloc) else {
                        continue;
                    };
                    let stream = allocation.stream.take();
                    let transport = allocation.transport;
                    self.unthrottle_transport(transport);
                    self.finish_alloc(alloc, stream);
                }
                TimerKey::TransportUnthrottle(transport) => {
                    self.unthrottle_transport(transport);
                }
                TimerKey::QueueUnthrottle(queue) => {
                    if self.queues[queue].window == Window::Throttled {
                        self.unthrottle_queue(queue);
                    }
                    self.queue_collect(queue);
                }
                TimerKey::QueueResume(queue) => self.resume_queue(queue),
            }
        }

        Ok(())
    }

    pub(crate) fn start_alloc(&mut self, transport: TransportKey, notify: Notify<S>) -> AllocId {
        let alloc = AllocId(self.next_alloc);
        self.next_alloc += 1;
        self.allocs.insert(
            alloc,
            Allocation {
                transport,
                notify,
                stream: None,
            },
        );
        alloc
    }

    /// Hand the outcome of `alloc` to its callback
    pub(crate) fn finish_alloc(&mut self, alloc: AllocId, stream: Option<S>) {
        let Some(allocation) = self.allocs.remove(&alloc) else {
            warn!(%alloc, "completion for unknown connection request");
            return;
        };
        (allocation.notify)(self, allocation.transport, stream);
    }
}
