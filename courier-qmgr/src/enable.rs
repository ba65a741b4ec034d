//! Operator and flush driven recovery.
//!
//! Enabling clears throttle state ahead of its timer and collects queues
//! that became empty while they could not be destroyed.

use courier_common::scheduler;

use crate::{
    list::List,
    model::{QUEUES, QueueKey, TRANSPORTS, TransportKey, Window},
    scheduler::Scheduler,
};

impl<S> Scheduler<S> {
    /// Unthrottle a throttled queue, then destroy it if it is ready and empty.
    pub fn enable_queue(&mut self, key: QueueKey) {
        if self.queues[key].window == Window::Throttled {
            self.unthrottle_queue(key);
        }
        self.queue_collect(key);
    }

    /// Revive a transport and enable each of its queues
    pub fn enable_transport(&mut self, key: TransportKey) {
        self.unthrottle_transport(key);

        let mut cursor = self.transports[key].queue_list.front();
        while let Some(queue) = cursor {
            cursor = List::next_of(&self.queues, queue, QUEUES);
            self.enable_queue(queue);
        }
    }

    /// Enable every transport, as for a flush of dead destinations
    pub fn enable_all(&mut self) {
        scheduler!(level = INFO, "enabling all transports and queues");

        let mut cursor = self.transport_list.front();
        while let Some(transport) = cursor {
            cursor = List::next_of(&self.transports, transport, TRANSPORTS);
            self.enable_transport(transport);
        }
    }
}
