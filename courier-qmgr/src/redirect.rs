//! The "error" and "retry" pseudo-transports.
//!
//! Recipients that should only be reported, bounced or retried later are
//! routed to a pseudo-transport queue keyed by the failure's status and
//! reason. Those queues have windows and throttling like any other.

use courier_common::Dsn;

use crate::{
    model::{QueueKey, TransportKey, Window},
    scheduler::Scheduler,
};

impl<S> Scheduler<S> {
    /// The pseudo-transport `service`, or `None` while it is throttled.
    ///
    /// # Panics
    ///
    /// Panics if `service` is neither the configured error nor retry service.
    pub fn error_transport(&mut self, service: &str) -> Option<TransportKey> {
        assert!(
            service == self.config.error_service || service == self.config.retry_service,
            "{service} is not a pseudo-transport"
        );

        let key = self.obtain_transport(service);
        (!self.transports[key].dead).then_some(key)
    }

    /// The queue of pseudo-transport `service` for `dsn`, or `None` if the
    /// transport or that queue is throttled.
    pub fn error_queue(&mut self, service: &str, dsn: &Dsn) -> Option<QueueKey> {
        let transport = self.error_transport(service)?;
        let queue = self.obtain_queue(transport, &dsn.key());
        (self.queues[queue].window != Window::Throttled).then_some(queue)
    }
}
