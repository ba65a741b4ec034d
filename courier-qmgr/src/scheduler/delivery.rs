use ahash::AHashMap;
use courier_common::Dsn;
use courier_spool::QueueId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Scheduler;
use crate::model::{DeliverFlags, EntryKey, EntryState, MessageKey, Recipient, Window};

/// What a delivery agent is asked to do for one busy entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub queue_id: QueueId,
    pub transport: String,
    pub nexthop: String,
    pub flags: DeliverFlags,
    pub recipients: Vec<Recipient>,
}

/// Per-recipient outcome reported by a delivery agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientStatus {
    Delivered,
    Deferred(Dsn),
    Bounced(Dsn),
}

/// How the delivery attempt as a whole went
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    /// The destination was reachable
    Ok,
    /// The destination failed as a whole; negative feedback for its queue
    SiteFailure(Dsn),
    /// The agent died or spoke nonsense
    Crashed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub status: AgentStatus,
    /// Outcomes keyed by recipient offset. Recipients missing here are
    /// deferred.
    pub recipients: Vec<(u64, RecipientStatus)>,
}

impl DeliveryReport {
    /// Every recipient of `request` delivered
    pub fn delivered(request: &DeliveryRequest) -> Self {
        Self {
            status: AgentStatus::Ok,
            recipients: request
                .recipients
                .iter()
                .map(|r| (r.offset, RecipientStatus::Delivered))
                .collect(),
        }
    }

    /// The agent went away without reporting anything
    pub const fn crashed() -> Self {
        Self {
            status: AgentStatus::Crashed,
            recipients: Vec::new(),
        }
    }
}

impl<S> Scheduler<S> {
    /// Describe a busy entry to its delivery agent.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not busy.
    pub fn delivery_request(&self, key: EntryKey) -> DeliveryRequest {
        let entry = &self.entries[key];
        assert_eq!(entry.state, EntryState::Busy, "request for a waiting entry");
        let queue = &self.queues[entry.queue];
        let message = &self.messages[entry.message];

        DeliveryRequest {
            queue_id: message.queue_id.clone(),
            transport: self.transports[queue.transport].name.clone(),
            nexthop: queue.nexthop.clone(),
            flags: message.flags,
            recipients: entry.recipients.clone(),
        }
    }

    /// Apply a delivery agent's report to a busy entry and dispose of it.
    ///
    /// Every recipient ends up delivered, bounced or deferred. The agent's
    /// overall status feeds the queue's concurrency window: success grows
    /// it, a site failure shrinks it and possibly throttles the queue, and a
    /// crashed agent takes the whole transport down.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not busy.
    pub fn delivery_done(&mut self, key: EntryKey, report: DeliveryReport) {
        let entry = &self.entries[key];
        assert_eq!(entry.state, EntryState::Busy, "delivery done for a waiting entry");
        let (queue, message) = (entry.queue, entry.message);
        let transport = self.queues[queue].transport;
        let recipients = entry.recipients.clone();

        let fallback = match &report.status {
            AgentStatus::Ok => Dsn::new("4.3.0", "delivery agent reported no status"),
            AgentStatus::SiteFailure(dsn) => dsn.clone(),
            AgentStatus::Crashed => Dsn::new("4.3.0", "unknown mail transport error"),
        };

        let mut outcomes: AHashMap<u64, RecipientStatus> = report.recipients.into_iter().collect();
        for recipient in &recipients {
            match outcomes.remove(&recipient.offset) {
                Some(RecipientStatus::Delivered) => self.recipient_delivered(message, recipient),
                Some(RecipientStatus::Bounced(dsn)) => {
                    self.bounce_recipient(message, recipient, &dsn);
                }
                Some(RecipientStatus::Deferred(dsn)) => {
                    self.defer_recipient(message, recipient, &dsn);
                }
                None => self.defer_recipient(message, recipient, &fallback),
            }
        }
        if !outcomes.is_empty() {
            warn!(
                queue_id = %self.messages[message].queue_id,
                "delivery agent reported {} unknown recipients",
                outcomes.len()
            );
        }

        match report.status {
            AgentStatus::Crashed => {
                self.messages[message].flags |= DeliverFlags::DEFER;
                self.throttle_transport(transport, fallback.clone());
                self.defer_transport(transport, &fallback);
            }
            AgentStatus::SiteFailure(dsn) => {
                if self.queues[queue].window.is_ready()
                    && self.throttle_queue(queue, dsn.clone())
                    && dsn.is_temporary()
                {
                    self.defer_todo(queue, &dsn);
                }
            }
            AgentStatus::Ok => {
                let window = self.queues[queue].window;
                if window.is_ready() || window == Window::Throttled {
                    self.unthrottle_queue(queue);
                }
            }
        }

        self.entry_done(key, EntryState::Busy);
    }

    fn recipient_delivered(&mut self, message: MessageKey, recipient: &Recipient) {
        let queue_id = &self.messages[message].queue_id;
        debug!(queue_id = %queue_id, recipient = %recipient.address, "delivered");

        if let Err(err) = self.source.mark_completed(queue_id, recipient.offset) {
            warn!(queue_id = %queue_id, "cannot mark {} done: {err}", recipient.address);
            self.messages[message].flags |= DeliverFlags::DEFER;
        }
    }
}
