use std::{fmt, num::NonZeroU32, time::Duration};

use courier_common::Dsn;

use super::{Entry, TransportKey};
use crate::{
    config::TransportSettings,
    list::{Links, List},
};

/// Concurrency state of a destination queue.
///
/// Only `Ready` carries a window; every other state means "deliver nothing".
/// A queue leaves `Ready` for any state but returns from any other state only
/// to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Ready(NonZeroU32),
    /// Backing off after repeated failures
    Throttled,
    /// Paused by a destination rate delay or an operator
    Suspended,
    /// Contents moved aside
    Saved,
}

impl Window {
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Concurrent deliveries allowed, 0 unless ready
    pub const fn slots(self) -> u32 {
        match self {
            Self::Ready(n) => n.get(),
            _ => 0,
        }
    }

    fn ready(n: u32) -> Self {
        Self::Ready(NonZeroU32::new(n.max(1)).unwrap_or(NonZeroU32::MIN))
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(n) => write!(f, "ready({n})"),
            Self::Throttled => f.write_str("throttled"),
            Self::Suspended => f.write_str("suspended"),
            Self::Saved => f.write_str("saved"),
        }
    }
}

/// The sub-queue of one transport for one destination
pub struct Queue {
    pub(crate) nexthop: String,
    pub(crate) transport: TransportKey,
    pub(crate) window: Window,
    pub(crate) todo_refcount: u32,
    pub(crate) busy_refcount: u32,
    pub(crate) success: f64,
    pub(crate) failure: f64,
    pub(crate) fail_cohorts: f64,
    pub(crate) last_done: Option<Duration>,
    pub(crate) dsn: Option<Dsn>,
    pub(crate) todo: List<Entry>,
    pub(crate) busy: List<Entry>,
    pub(crate) links: Links<Self>,
}

impl Queue {
    pub(crate) fn new(nexthop: &str, transport: TransportKey, settings: &TransportSettings) -> Self {
        Self {
            nexthop: nexthop.to_string(),
            transport,
            window: Window::ready(settings.init_dest_concurrency),
            todo_refcount: 0,
            busy_refcount: 0,
            success: 0.0,
            failure: 0.0,
            fail_cohorts: 0.0,
            last_done: None,
            dsn: None,
            todo: List::default(),
            busy: List::default(),
            links: Links::default(),
        }
    }

    pub fn nexthop(&self) -> &str {
        &self.nexthop
    }

    pub const fn transport(&self) -> TransportKey {
        self.transport
    }

    pub const fn window(&self) -> Window {
        self.window
    }

    pub const fn todo_refcount(&self) -> u32 {
        self.todo_refcount
    }

    pub const fn busy_refcount(&self) -> u32 {
        self.busy_refcount
    }

    pub const fn last_done(&self) -> Option<Duration> {
        self.last_done
    }

    /// Why the queue is throttled
    pub const fn dsn(&self) -> Option<&Dsn> {
        self.dsn.as_ref()
    }

    pub const fn is_empty(&self) -> bool {
        self.todo.is_empty() && self.busy.is_empty()
    }

    /// Unused concurrency; negative after the window shrank below `busy`
    pub fn spare(&self) -> i64 {
        i64::from(self.window.slots()) - i64::from(self.busy_refcount)
    }

    /// Whether another entry may be handed to a delivery agent
    pub const fn has_capacity(&self) -> bool {
        self.window.slots() > self.busy_refcount
    }

    /// Change state, enforcing that non-ready states only return to ready.
    pub(crate) fn set_window(&mut self, next: Window) {
        assert!(
            self.window.is_ready() || next.is_ready(),
            "bad queue status transition for {}: {} -> {}",
            self.nexthop,
            self.window,
            next
        );
        self.window = next;
    }

    /// The window a queue gets when it becomes ready again
    pub(crate) fn recovery_window(&self, settings: &TransportSettings) -> Window {
        if self.busy_refcount > 0 {
            Window::ready(self.busy_refcount)
        } else {
            Window::ready(settings.init_dest_concurrency)
        }
    }

    pub(crate) fn reset_feedback(&mut self) {
        self.success = 0.0;
        self.failure = 0.0;
        self.fail_cohorts = 0.0;
    }

    /// Apply positive feedback to a ready queue.
    ///
    /// The window only opens while it is below `busy + init` so that an idle
    /// destination does not accumulate concurrency it never uses.
    pub(crate) fn grow(&mut self, settings: &TransportSettings) {
        let Window::Ready(current) = self.window else {
            return;
        };
        let mut window = current.get();
        let limit = settings.window_limit();

        if limit.is_some_and(|limit| window >= limit)
            || window >= self.busy_refcount + settings.init_dest_concurrency
        {
            return;
        }

        let feedback = settings.positive_feedback.value(window);
        self.success += feedback;
        while self.success + feedback / 2.0 >= 1.0 {
            window += 1;
            self.success -= 1.0;
            self.failure = 0.0;
        }

        if let Some(limit) = limit {
            window = window.min(limit);
        }
        self.window = Window::ready(window);
    }

    /// Apply negative feedback to a ready queue, returning whether the queue
    /// crossed the cohort limit and is now throttled.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not ready.
    pub(crate) fn shrink(&mut self, settings: &TransportSettings) -> bool {
        let Window::Ready(current) = self.window else {
            panic!("bad queue status for {}: {}", self.nexthop, self.window);
        };
        let window = current.get();

        self.fail_cohorts += 1.0 / f64::from(window);
        if settings.cohort_limit > 0 && self.fail_cohorts >= f64::from(settings.cohort_limit) {
            self.set_window(Window::Throttled);
            return true;
        }

        if window > 1 {
            let feedback = settings.negative_feedback.value(window);
            let mut shrunk = i64::from(window);
            self.failure -= feedback;
            while self.failure + feedback / 2.0 < 0.0 {
                shrunk -= 1;
                self.success = 0.0;
                self.failure += 1.0;
            }
            self.window = Window::ready(u32::try_from(shrunk.max(1)).unwrap_or(1));
        }

        false
    }
}
