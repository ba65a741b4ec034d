use std::time::Duration;

use courier_common::{Dsn, scheduler};

use super::Scheduler;
use crate::{
    model::{QueueKey, Window},
    timer::TimerKey,
};

impl<S> Scheduler<S> {
    /// Negative feedback for a ready queue. Returns whether the queue is now
    /// throttled, in which case it resumes after the minimal backoff time.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not ready or already carries a reason.
    pub fn throttle_queue(&mut self, key: QueueKey, dsn: Dsn) -> bool {
        let backoff = self.clock.now() + Duration::from_secs(self.config.min_backoff_time_secs);
        let queue = &mut self.queues[key];
        assert!(
            queue.window.is_ready(),
            "throttle of queue {} in state {}",
            queue.nexthop,
            queue.window
        );
        assert!(queue.dsn.is_none(), "queue {} already has a reason", queue.nexthop);

        let settings = &self.transports[queue.transport].settings;
        if !queue.shrink(settings) {
            scheduler!("queue {} window now {}", queue.nexthop, queue.window);
            return false;
        }

        scheduler!(level = WARN, "queue {} throttled: {dsn}", queue.nexthop);
        queue.dsn = Some(dsn);
        self.timers.arm(TimerKey::QueueUnthrottle(key), backoff);
        true
    }

    /// Positive feedback: revive a throttled queue or grow a ready one.
    pub fn unthrottle_queue(&mut self, key: QueueKey) {
        let queue = &mut self.queues[key];
        let settings = &self.transports[queue.transport].settings;
        queue.fail_cohorts = 0.0;

        if queue.window == Window::Throttled {
            self.timers.cancel(TimerKey::QueueUnthrottle(key));
            let reason = queue.dsn.take();
            assert!(reason.is_some(), "throttled queue {} without reason", queue.nexthop);

            let window = queue.recovery_window(settings);
            queue.set_window(window);
            queue.reset_feedback();
            scheduler!(level = INFO, "queue {} unthrottled, window {window}", queue.nexthop);
            return;
        }

        queue.grow(settings);
    }

    /// Pause a ready queue for `delay`.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not ready.
    pub fn suspend_queue(&mut self, key: QueueKey, delay: Duration) {
        let resume = self.clock.now() + delay;
        let queue = &mut self.queues[key];
        assert!(
            queue.window.is_ready(),
            "suspend of queue {} in state {}",
            queue.nexthop,
            queue.window
        );

        queue.set_window(Window::Suspended);
        self.timers.arm(TimerKey::QueueResume(key), resume);
        scheduler!("queue {} suspended for {delay:?}", queue.nexthop);
    }

    /// End a suspension. An empty queue is destroyed.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not suspended.
    pub fn resume_queue(&mut self, key: QueueKey) {
        let queue = &mut self.queues[key];
        assert_eq!(
            queue.window,
            Window::Suspended,
            "resume of queue {} that is not suspended",
            queue.nexthop
        );

        self.timers.cancel(TimerKey::QueueResume(key));
        let window = queue.recovery_window(&self.transports[queue.transport].settings);
        queue.set_window(window);
        scheduler!("queue {} resumed, window {window}", queue.nexthop);

        self.queue_collect(key);
    }

    /// Move every waiting entry of a ready queue aside and stop delivery to it.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not ready or `dsn` is not a temporary failure.
    pub fn save_queue(&mut self, key: QueueKey, dsn: &Dsn) {
        let queue = &mut self.queues[key];
        assert!(
            queue.window.is_ready(),
            "save of queue {} in state {}",
            queue.nexthop,
            queue.window
        );

        queue.set_window(Window::Saved);
        scheduler!(level = INFO, "queue {} saved: {dsn}", queue.nexthop);
        self.defer_todo(key, dsn);
    }

    /// Undo [`save_queue`](Self::save_queue). An empty queue is destroyed.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not saved.
    pub fn restore_queue(&mut self, key: QueueKey) {
        let queue = &mut self.queues[key];
        assert_eq!(
            queue.window,
            Window::Saved,
            "restore of queue {} that is not saved",
            queue.nexthop
        );

        let window = queue.recovery_window(&self.transports[queue.transport].settings);
        queue.set_window(window);
        scheduler!(level = INFO, "queue {} restored", queue.nexthop);

        self.queue_collect(key);
    }
}
