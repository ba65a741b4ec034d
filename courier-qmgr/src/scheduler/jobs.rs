//! Admission of messages, entry bookkeeping and entry selection.
//!
//! Entry selection walks a transport's job list starting at the current job.
//! Before each selection the current job may be preempted: a younger job
//! that needs few entries is stacked in front of it and served first, paid
//! for with delivery slots the current job accumulated. A job leaves the
//! list (retires) once it has nothing left to select.

use std::time::SystemTime;

use courier_common::{Dsn, scheduler};
use courier_spool::QueueId;
use tracing::debug;

use super::Scheduler;
use crate::{
    list::List,
    model::{
        DeliverFlags, Entry, EntryKey, EntryState, JOBS, JOBS_BY_TIME, Job, JobKey, Message,
        MessageKey, PEER_ENTRIES, PEERS, Peer, PeerKey, QUEUE_ENTRIES, QueueKey, Recipient,
        RoutedRecipient, TRANSPORTS, TransportKey, Window,
    },
};

/// A message entering the active queue
#[derive(Debug, Clone)]
pub struct Admission {
    pub queue_id: QueueId,
    pub arrival: SystemTime,
    pub recipients: Vec<RoutedRecipient>,
    /// Deliver even through transports listed in `defer_transports`
    pub override_defer_transports: bool,
}

impl<S> Scheduler<S> {
    /// Bring a message into core and read in as many recipients as the
    /// in-core limits allow.
    ///
    /// A message with nothing to deliver is released before this returns, so
    /// the returned key may already be stale.
    pub fn admit(&mut self, admission: Admission) -> MessageKey {
        let key = self.messages.insert(Message {
            queue_id: admission.queue_id,
            arrival: admission.arrival,
            admitted_at: self.clock.now(),
            flags: DeliverFlags::empty(),
            override_defer: admission.override_defer_transports,
            refcount: 0,
            unread: admission.recipients.into(),
            jobs: ahash::AHashMap::new(),
            waiting: false,
        });

        debug!(
            queue_id = %self.messages[key].queue_id,
            recipients = self.messages[key].unread.len(),
            "message admitted"
        );

        self.read_recipients(key);
        self.release_if_finished(key);
        key
    }

    /// Assign unread recipients of `message` to entries, in queue-file order.
    fn read_recipients(&mut self, message: MessageKey) {
        while let Some(next) = self.messages[message].unread.front() {
            let name = next.transport.clone();
            let transport = self.obtain_transport(&name);

            if !self.messages[message].override_defer
                && self.config.is_deferred_transport(&self.transports[transport].name)
            {
                self.defer_unread(message, &Dsn::new("4.3.2", "deferred transport"));
                continue;
            }

            if let Some(dsn) = self.transports[transport].dsn.clone() {
                self.defer_unread(message, &dsn);
                continue;
            }

            let job_rcpts = self.messages[message]
                .job(transport)
                .map_or(0, |job| self.jobs[job].rcpt_count);
            if !self.transports[transport].may_read(job_rcpts) {
                let waiting = &mut self.messages[message].waiting;
                if !*waiting {
                    *waiting = true;
                    self.waiting.push_back(message);
                }
                return;
            }

            let Some(routed) = self.messages[message].unread.pop_front() else {
                return;
            };
            let queue = self.obtain_queue(transport, &routed.nexthop);
            if self.queues[queue].window == Window::Throttled {
                let dsn = self.queues[queue]
                    .dsn
                    .clone()
                    .unwrap_or_else(|| Dsn::new("4.3.0", "destination throttled"));
                self.defer_recipient(message, &routed.recipient, &dsn);
                continue;
            }

            let job = self.obtain_job(message, transport);
            self.assign(job, queue, routed.recipient);
        }
    }

    fn defer_unread(&mut self, message: MessageKey, dsn: &Dsn) {
        if let Some(routed) = self.messages[message].unread.pop_front() {
            self.defer_recipient(message, &routed.recipient, dsn);
        }
    }

    /// Read in recipients of waiting messages once enough in-core slots have
    /// been freed, or enough time has passed since the last read-in.
    pub fn refill(&mut self) {
        if self.waiting.is_empty() {
            return;
        }

        let now = self.clock.now();
        let mut due = false;
        let mut cursor = self.transport_list.front();
        while let Some(key) = cursor {
            cursor = List::next_of(&self.transports, key, TRANSPORTS);
            let transport = &mut self.transports[key];
            if transport.refill_credit >= transport.settings.xport_refill_limit
                || (transport.refill_credit > 0
                    && now.saturating_sub(transport.last_refill)
                        >= transport.settings.xport_refill_delay)
            {
                transport.refill_credit = 0;
                transport.last_refill = now;
                due = true;
            }
        }
        if !due {
            return;
        }

        for message in std::mem::take(&mut self.waiting) {
            if !self.messages.contains(message) {
                continue;
            }
            self.messages[message].waiting = false;
            self.read_recipients(message);
            self.release_if_finished(message);
        }
    }

    /// The job of `message` on `transport`; a retired job rejoins the list.
    pub(crate) fn obtain_job(&mut self, message: MessageKey, transport: TransportKey) -> JobKey {
        if let Some(job) = self.messages[message].job(transport) {
            if self.jobs[job].stack_level.is_none() {
                self.jobs[job].stack_level = Some(0);
                self.transports[transport]
                    .job_list
                    .push_back(&mut self.jobs, job, JOBS);
            }
            return job;
        }

        let job = self.jobs.insert(Job::new(message, transport));
        let owner = &mut self.transports[transport];
        owner.job_list.push_back(&mut self.jobs, job, JOBS);
        owner.job_bytime.push_back(&mut self.jobs, job, JOBS_BY_TIME);
        self.messages[message].jobs.insert(transport, job);
        job
    }

    fn obtain_peer(&mut self, job: JobKey, queue: QueueKey) -> PeerKey {
        if let Some(peer) = self.jobs[job].peer(queue) {
            return peer;
        }

        let peer = self.peers.insert(Peer::new(job, queue));
        let owner = &mut self.jobs[job];
        owner.peer_list.push_back(&mut self.peers, peer, PEERS);
        owner.peers.insert(queue, peer);
        peer
    }

    /// Add a recipient to the newest waiting entry of the peer, or to a new
    /// entry once that one reached the transport's recipient limit.
    fn assign(&mut self, job: JobKey, queue: QueueKey, recipient: Recipient) {
        let peer = self.obtain_peer(job, queue);
        let transport = self.jobs[job].transport;
        let limit = self.transports[transport].settings.recipient_limit as usize;

        let entry = match self.peers[peer].entries.back() {
            Some(entry) if limit == 0 || self.entries[entry].recipients.len() < limit => entry,
            _ => self.entry_create(peer),
        };

        self.entries[entry].recipients.push(recipient);
        self.jobs[job].rcpt_count += 1;
        self.transports[transport].rcpt_in_core += 1;
    }

    /// A new, empty entry at the end of the peer's and the queue's todo lists
    pub(crate) fn entry_create(&mut self, peer: PeerKey) -> EntryKey {
        let Peer { job, queue, .. } = self.peers[peer];
        let message = self.jobs[job].message;

        let entry = self.entries.insert(Entry::new(message, queue, peer));

        let owner = &mut self.peers[peer];
        owner.entries.push_back(&mut self.entries, entry, PEER_ENTRIES);
        owner.refcount += 1;

        let owner = &mut self.queues[queue];
        owner.todo.push_back(&mut self.entries, entry, QUEUE_ENTRIES);
        owner.todo_refcount += 1;

        self.messages[message].refcount += 1;
        let owner = &mut self.jobs[job];
        owner.read_entries += 1;
        owner.todo_entries += 1;

        entry
    }

    /// Move a waiting entry to another queue, possibly of another transport.
    ///
    /// # Panics
    ///
    /// Panics if the entry is busy or already belongs to `destination`.
    pub fn entry_move_todo(&mut self, destination: QueueKey, entry: EntryKey) -> EntryKey {
        let current = &self.entries[entry];
        assert_ne!(
            current.queue, destination,
            "queue entry is already on its destination"
        );
        assert_eq!(current.state, EntryState::Todo, "move of a busy entry");

        let message = current.message;
        let recipients = current.recipients.clone();
        let count = u32::try_from(recipients.len()).unwrap_or(u32::MAX);

        let transport = self.queues[destination].transport;
        let job = self.obtain_job(message, transport);
        let peer = self.obtain_peer(job, destination);
        let moved = self.entry_create(peer);

        self.entries[moved].recipients = recipients;
        self.jobs[job].rcpt_count += count;
        self.transports[transport].rcpt_in_core += count;

        self.entry_done(entry, EntryState::Todo);
        moved
    }

    /// Dispose of an entry that left the todo or busy list of its queue.
    ///
    /// Releases the peer, the queue and the message when this was their
    /// last reference.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not on the list named by `which`.
    pub fn entry_done(&mut self, key: EntryKey, which: EntryState) {
        let entry = &self.entries[key];
        assert_eq!(entry.state, which, "entry done from the wrong list");
        let Entry {
            message,
            queue,
            peer,
            ..
        } = *entry;
        let job = self.peers[peer].job;
        let transport = self.jobs[job].transport;

        match which {
            EntryState::Todo => {
                let owner = &mut self.queues[queue];
                owner.todo.unlink(&mut self.entries, key, QUEUE_ENTRIES);
                owner.todo_refcount -= 1;
                self.peers[peer]
                    .entries
                    .unlink(&mut self.entries, key, PEER_ENTRIES);
                self.jobs[job].todo_entries -= 1;
            }
            EntryState::Busy => {
                let now = self.clock.now();
                let owner = &mut self.queues[queue];
                owner.busy.unlink(&mut self.entries, key, QUEUE_ENTRIES);
                owner.busy_refcount -= 1;
                owner.last_done = Some(now);
            }
        }

        let entry = self.entries.remove(key);
        let count = u32::try_from(entry.recipients.len()).unwrap_or(u32::MAX);
        self.jobs[job].rcpt_count -= count;
        let owner = &mut self.transports[transport];
        owner.rcpt_in_core -= count;
        owner.refill_credit = owner.refill_credit.saturating_add(count);
        let rate_delay = owner.settings.dest_rate_delay;

        self.peers[peer].refcount -= 1;
        if self.peers[peer].refcount == 0 {
            let owner = &mut self.jobs[job];
            owner.peer_list.unlink(&mut self.peers, peer, PEERS);
            owner.peers.remove(&queue);
            self.peers.remove(peer);
        }

        if which == EntryState::Busy
            && !rate_delay.is_zero()
            && self.queues[queue].window.is_ready()
        {
            self.suspend_queue(queue, rate_delay);
        }
        self.queue_collect(queue);

        self.messages[message].refcount -= 1;
        self.refill();
        if self.messages.contains(message) {
            self.release_if_finished(message);
        }
    }

    /// Free a message that has no entries and nothing left to read, and hand
    /// it back to the message source.
    pub(crate) fn release_if_finished(&mut self, key: MessageKey) {
        if !self.messages[key].is_finished() {
            return;
        }

        let message = self.messages.remove(key);
        for job in message.jobs.into_values() {
            self.job_free(job);
        }

        if message.flags.contains(DeliverFlags::DEFER) {
            debug!(queue_id = %message.queue_id, "message deferred");
        } else {
            debug!(queue_id = %message.queue_id, "message done");
        }
        self.source.release(&message.queue_id, message.flags);
    }

    fn job_free(&mut self, key: JobKey) {
        assert!(
            self.jobs[key].peer_list.is_empty(),
            "job freed with peers left"
        );

        if self.jobs[key].stack_level.is_some() {
            self.job_retire(key);
        }
        let transport = self.jobs[key].transport;
        self.transports[transport]
            .job_bytime
            .unlink(&mut self.jobs, key, JOBS_BY_TIME);
        self.jobs.remove(key);
    }

    /// Choose the next entry for a fresh connection of `transport` and mark
    /// it busy. Returns `None` when nothing is deliverable right now.
    pub fn select_entry(&mut self, transport: TransportKey) -> Option<EntryKey> {
        let start = self.transports[transport]
            .job_current
            .or_else(|| self.transports[transport].job_list.front())?;
        let start = self.preempt(start);
        self.transports[transport].job_current = Some(start);

        // Walk from the start job to the end, then wrap around to it.
        let front = self.transports[transport].job_list.front();
        let mut cursor = Some(start);
        let mut wrapped = front == Some(start);
        while let Some(job) = cursor {
            cursor = List::next_of(&self.jobs, job, JOBS);
            if cursor.is_none() && !wrapped {
                cursor = front;
                wrapped = true;
            }
            if wrapped && cursor == Some(start) {
                cursor = None;
            }

            let Some(peer) = self.peer_select(job) else {
                continue;
            };
            let entry = self.entry_select(peer);
            self.transports[transport].job_current = Some(job);
            self.count_slots(job);

            if self.jobs[job].todo_entries == 0
                && self.messages[self.jobs[job].message].unread.is_empty()
            {
                self.job_retire(job);
            }
            return Some(entry);
        }

        None
    }

    /// The first peer of `job` whose queue can take another delivery. The
    /// chosen peer moves to the end of the job's rotation.
    fn peer_select(&mut self, job: JobKey) -> Option<PeerKey> {
        let mut cursor = self.jobs[job].peer_list.front();
        while let Some(peer) = cursor {
            cursor = List::next_of(&self.peers, peer, PEERS);

            let candidate = &self.peers[peer];
            if !candidate.entries.is_empty() && self.queues[candidate.queue].has_capacity() {
                self.jobs[job]
                    .peer_list
                    .rotate_after(&mut self.peers, peer, PEERS);
                return Some(peer);
            }
        }
        None
    }

    /// Move the oldest waiting entry of `peer` to its queue's busy list
    fn entry_select(&mut self, peer: PeerKey) -> EntryKey {
        let Peer { job, queue, .. } = self.peers[peer];
        let Some(entry) = self.peers[peer].entries.front() else {
            panic!("selected peer without entries");
        };

        self.peers[peer]
            .entries
            .unlink(&mut self.entries, entry, PEER_ENTRIES);
        let owner = &mut self.queues[queue];
        owner.todo.unlink(&mut self.entries, entry, QUEUE_ENTRIES);
        owner.todo_refcount -= 1;
        owner.busy.push_back(&mut self.entries, entry, QUEUE_ENTRIES);
        owner.busy_refcount += 1;
        self.entries[entry].state = EntryState::Busy;

        let owner = &mut self.jobs[job];
        owner.todo_entries -= 1;
        owner.selected_entries += 1;
        entry
    }

    fn count_slots(&mut self, job: JobKey) {
        let owner = &mut self.jobs[job];
        owner.slots_used += 1;
        if owner.stack_level == Some(0) {
            owner.slots_available += 1;
        }
    }

    /// Stack a younger job in front of `current` when the slots `current`
    /// accumulated pay for all of that job's waiting entries. Returns the job
    /// to serve.
    ///
    /// Among affordable candidates the one with the highest age per needed
    /// entry wins; ties keep the older candidate.
    fn preempt(&mut self, current: JobKey) -> JobKey {
        let transport = self.jobs[current].transport;
        let settings = &self.transports[transport].settings;
        if !settings.preemption_enabled() {
            return current;
        }
        let cost = i64::from(settings.slot_cost);
        let loan = i64::from(settings.slot_loan);
        let loan_factor = i64::from(settings.slot_loan_factor);
        let min_entries = i64::from(settings.min_slots) * cost;

        let job = &self.jobs[current];
        let Some(level) = job.stack_level else {
            return current;
        };
        if job.slots_available <= 0 || i64::from(job.read_entries) < min_entries {
            return current;
        }
        let budget = job.slots_available / cost + loan;

        let now = self.clock.now();
        let mut best: Option<(JobKey, f64, i64)> = None;
        let mut cursor = List::next_of(&self.jobs, current, JOBS_BY_TIME);
        while let Some(candidate) = cursor {
            cursor = List::next_of(&self.jobs, candidate, JOBS_BY_TIME);

            let job = &self.jobs[candidate];
            if job.stack_level != Some(0) || job.todo_entries == 0 {
                continue;
            }
            let needed = i64::from(job.todo_entries);
            if needed > budget {
                continue;
            }

            let age = now
                .saturating_sub(self.messages[job.message].admitted_at)
                .as_secs_f64();
            let score = age / f64::from(job.todo_entries);
            if best.is_none_or(|(_, top, _)| score > top) {
                best = Some((candidate, score, needed));
            }
        }

        let Some((candidate, _, needed)) = best else {
            return current;
        };
        if budget * 100 < needed * loan_factor {
            return current;
        }

        let charge = needed * cost;
        let owner = &mut self.transports[transport];
        owner.job_list.unlink(&mut self.jobs, candidate, JOBS);
        owner
            .job_list
            .insert_before(&mut self.jobs, candidate, current, JOBS);

        let stacked = &mut self.jobs[candidate];
        stacked.stack_parent = Some(current);
        stacked.stack_level = Some(level + 1);
        stacked.slots_charged = charge;
        let parent = &mut self.jobs[current];
        parent.stack_children += 1;
        parent.slots_available -= charge;

        scheduler!(
            "{}: job preempted by {} needing {needed} entries",
            self.messages[self.jobs[current].message].queue_id,
            self.messages[self.jobs[candidate].message].queue_id
        );
        candidate
    }

    /// Take `key` off its transport's job list, refunding unused slots to a
    /// stack parent and handing any stacked children to that parent.
    fn job_retire(&mut self, key: JobKey) {
        let transport = self.jobs[key].transport;
        let next = List::next_of(&self.jobs, key, JOBS);
        let parent = self.jobs[key].stack_parent;

        if let Some(parent) = parent {
            let cost = i64::from(self.transports[transport].settings.slot_cost);
            let job = &mut self.jobs[key];
            let refund = (job.slots_charged - i64::from(job.slots_used) * cost).max(0);
            job.stack_parent = None;
            job.slots_charged = 0;

            let owner = &mut self.jobs[parent];
            owner.slots_available += refund;
            owner.stack_children -= 1;
        }

        if self.jobs[key].stack_children > 0 {
            let children: Vec<JobKey> = self.transports[transport]
                .job_list
                .iter(&self.jobs, JOBS)
                .filter(|child| self.jobs[*child].stack_parent == Some(key))
                .collect();
            for child in children {
                let job = &mut self.jobs[child];
                job.stack_parent = parent;
                job.stack_level = job.stack_level.map(|level| level.saturating_sub(1));
                if let Some(parent) = parent {
                    self.jobs[parent].stack_children += 1;
                }
            }
            self.jobs[key].stack_children = 0;
        }

        let owner = &mut self.transports[transport];
        if owner.job_current == Some(key) {
            owner.job_current = parent.or(next);
        }
        owner.job_list.unlink(&mut self.jobs, key, JOBS);
        self.jobs[key].stack_level = None;
    }
}
