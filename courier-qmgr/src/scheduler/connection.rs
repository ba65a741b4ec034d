use std::{io, time::Duration};

use courier_common::{Dsn, scheduler};
use tracing::warn;

use super::{Notify, Scheduler};
use crate::{
    connect::AllocId,
    list::List,
    model::{QUEUES, TRANSPORTS, TransportKey},
    timer::TimerKey,
};

/// Connection requests a transport may have in flight at once
pub const PIPELINE_DEPTH: u32 = 2;

impl<S> Scheduler<S> {
    /// Pick the next transport that deserves a connection, round-robin.
    ///
    /// A transport qualifies when it is alive, not rate locked, has fewer
    /// than [`PIPELINE_DEPTH`] requests pending, and its ready queues hold
    /// enough deliverable work to use one more connection than it already
    /// asked for. The chosen transport moves to the end of the rotation.
    pub fn select(&mut self) -> Option<TransportKey> {
        let mut cursor = self.transport_list.front();

        while let Some(key) = cursor {
            cursor = List::next_of(&self.transports, key, TRANSPORTS);

            if self.wants_connection(key) {
                self.transport_list
                    .rotate_after(&mut self.transports, key, TRANSPORTS);
                return Some(key);
            }
        }

        None
    }

    fn wants_connection(&self, key: TransportKey) -> bool {
        let transport = &self.transports[key];
        if transport.dead || transport.rate_locked || transport.pending >= PIPELINE_DEPTH {
            return false;
        }

        let mut need = i64::from(transport.pending) + 1;
        for queue in transport.queue_list.iter(&self.queues, QUEUES) {
            let queue = &self.queues[queue];
            if !queue.window.is_ready() {
                continue;
            }
            need -= queue.spare().min(i64::from(queue.todo_refcount));
            if need <= 0 {
                return true;
            }
        }

        false
    }

    /// Request a connection to the delivery agent of `key`.
    ///
    /// `notify` runs once the request settles: with the stream on success,
    /// with `None` if the agent is unreachable.
    ///
    /// # Panics
    ///
    /// Panics if the transport is dead, rate locked, or already has
    /// [`PIPELINE_DEPTH`] requests in flight.
    pub fn alloc(&mut self, key: TransportKey, notify: Notify<S>) -> AllocId {
        let now = self.clock.now();
        let transport = &mut self.transports[key];
        assert!(
            !transport.dead && !transport.rate_locked,
            "transport {} is dead or rate locked",
            transport.name
        );
        assert!(
            transport.pending < PIPELINE_DEPTH,
            "excess allocation for transport {}",
            transport.name
        );

        transport.pending += 1;
        if !transport.settings.xport_rate_delay.is_zero() {
            transport.rate_locked = true;
        }
        let name = transport.name.clone();

        let alloc = self.start_alloc(key, notify);
        match self.connector.connect(&name, alloc) {
            Ok(()) => {
                let timeout = Duration::from_secs(self.config.daemon_timeout_secs);
                self.timers.arm(TimerKey::ConnectWatchdog(alloc), now + timeout);
            }
            Err(err) => {
                warn!(%alloc, "connect to transport {name}: {err}");
                self.throttle_transport(key, Dsn::new("4.3.0", "mail transport unavailable"));
                // Report the failure from the timer loop, never from inside alloc.
                self.timers.arm(TimerKey::ConnectFailed(alloc), now);
            }
        }

        alloc
    }

    /// A connection request settled.
    ///
    /// A failed connect throttles the transport. With a transport rate delay
    /// a stream is held until the delay expires, which also releases the
    /// rate lock.
    pub fn connect_complete(&mut self, alloc: AllocId, result: io::Result<S>) {
        let now = self.clock.now();
        let Some(allocation) = self.allocs.get(&alloc) else {
            warn!(%alloc, "completion for unknown connection request");
            return;
        };
        let key = allocation.transport;
        self.timers.cancel(TimerKey::ConnectWatchdog(alloc));

        let transport = &mut self.transports[key];
        transport.pending -= 1;
        let delay = transport.settings.xport_rate_delay;

        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%alloc, "connect to transport {}: {err}", transport.name);
                self.throttle_transport(key, Dsn::new("4.3.0", "mail transport unavailable"));
                self.finish_alloc(alloc, None);
                return;
            }
        };

        if !delay.is_zero() {
            if let Some(allocation) = self.allocs.get_mut(&alloc) {
                allocation.stream = Some(stream);
            }
            self.timers.arm(TimerKey::RateDelay(alloc), now + delay);
            return;
        }

        self.finish_alloc(alloc, Some(stream));
    }

    /// Mark a transport dead until its retry time passes. Throttling a dead
    /// transport changes nothing and arms no second timer.
    pub fn throttle_transport(&mut self, key: TransportKey, dsn: Dsn) {
        let retry = self.clock.now() + Duration::from_secs(self.config.transport_retry_time_secs);
        let transport = &mut self.transports[key];
        if transport.dead {
            return;
        }

        scheduler!(level = WARN, "transport {} throttled: {dsn}", transport.name);
        transport.dead = true;
        transport.dsn = Some(dsn);
        self.timers.arm(TimerKey::TransportUnthrottle(key), retry);
    }

    /// Release the rate lock and, if the transport is dead, revive it.
    pub fn unthrottle_transport(&mut self, key: TransportKey) {
        let transport = &mut self.transports[key];
        transport.rate_locked = false;

        if transport.dead {
            scheduler!(level = INFO, "transport {} unthrottled", transport.name);
            transport.dead = false;
            transport.dsn = None;
            self.timers.cancel(TimerKey::TransportUnthrottle(key));
        }
    }
}
