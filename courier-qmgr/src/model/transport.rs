use std::time::Duration;

use ahash::AHashMap;
use courier_common::Dsn;

use super::{Job, JobKey, Queue, QueueKey};
use crate::{config::TransportSettings, list::{Links, List}};

/// One outbound channel and its delivery-agent service.
///
/// Transports are created on first reference and live for the rest of the
/// process. They are only ever throttled and unthrottled.
pub struct Transport {
    pub(crate) name: String,
    pub(crate) settings: TransportSettings,
    pub(crate) dead: bool,
    pub(crate) rate_locked: bool,
    /// Connection requests in flight
    pub(crate) pending: u32,
    pub(crate) dsn: Option<Dsn>,
    pub(crate) queues: AHashMap<String, QueueKey>,
    pub(crate) queue_list: List<Queue>,
    pub(crate) job_list: List<Job>,
    pub(crate) job_bytime: List<Job>,
    pub(crate) job_current: Option<JobKey>,
    /// Recipients of this transport held in core
    pub(crate) rcpt_in_core: u32,
    /// Recipient slots freed since the last read-in
    pub(crate) refill_credit: u32,
    pub(crate) last_refill: Duration,
    pub(crate) links: Links<Self>,
}

impl Transport {
    pub(crate) fn new(name: &str, settings: TransportSettings, now: Duration) -> Self {
        Self {
            name: name.to_string(),
            settings,
            dead: false,
            rate_locked: false,
            pending: 0,
            dsn: None,
            queues: AHashMap::new(),
            queue_list: List::default(),
            job_list: List::default(),
            job_bytime: List::default(),
            job_current: None,
            rcpt_in_core: 0,
            refill_credit: 0,
            last_refill: now,
            links: Links::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub const fn is_dead(&self) -> bool {
        self.dead
    }

    pub const fn is_rate_locked(&self) -> bool {
        self.rate_locked
    }

    pub const fn pending(&self) -> u32 {
        self.pending
    }

    /// Why the transport is dead
    pub const fn dsn(&self) -> Option<&Dsn> {
        self.dsn.as_ref()
    }

    pub fn queue_count(&self) -> usize {
        self.queue_list.len()
    }

    /// Jobs still competing for delivery
    pub const fn active_jobs(&self) -> usize {
        self.job_list.len()
    }

    pub const fn rcpt_in_core(&self) -> u32 {
        self.rcpt_in_core
    }

    /// Whether this transport may hold another in-core recipient for a job
    /// that already holds `job_rcpts`.
    pub(crate) const fn may_read(&self, job_rcpts: u32) -> bool {
        job_rcpts < self.settings.stack_rcpt_limit
            || self.rcpt_in_core < self.settings.xport_rcpt_limit
    }
}
