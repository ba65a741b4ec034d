//! Scheduling scenarios and the scheduler's externally visible guarantees
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::time::Duration;

use courier_common::Dsn;
use courier_qmgr::{
    AgentStatus, DeliveryReport, PIPELINE_DEPTH, QmgrError, RecipientStatus,
    TimerKey, TransportOverrides,
    model::{DeliverFlags, EntryKey, Window},
};
use pretty_assertions::assert_eq;
use support::Harness;

fn delivered(h: &Harness, entry: EntryKey) -> DeliveryReport {
    DeliveryReport::delivered(&h.scheduler.delivery_request(entry))
}

fn site_failure(h: &Harness, entry: EntryKey, dsn: &Dsn) -> DeliveryReport {
    DeliveryReport {
        status: AgentStatus::SiteFailure(dsn.clone()),
        recipients: h
            .scheduler
            .delivery_request(entry)
            .recipients
            .iter()
            .map(|r| (r.offset, RecipientStatus::Deferred(dsn.clone())))
            .collect(),
    }
}

fn refused() -> Dsn {
    Dsn::new("4.4.1", "connection refused")
}

#[test]
fn scenario_a_single_slot_serializes_entries() {
    let mut h = Harness::with(|c| c.dest_concurrency_limit = 1);
    let first_message = h.admit("MSG1", &[("smtp", "example.com", "a@example.com")]);
    let second_message = h.admit("MSG2", &[("smtp", "example.com", "b@example.com")]);
    let queue = h.queue("smtp", "example.com").unwrap();
    assert_eq!(h.scheduler.queue(queue).unwrap().window().slots(), 1);
    assert_eq!(h.scheduler.queue(queue).unwrap().todo_refcount(), 2);

    let first = h.dispatch().expect("an entry is deliverable");
    assert_eq!(h.scheduler.entry(first).unwrap().message(), first_message);
    assert_eq!(h.scheduler.queue(queue).unwrap().busy_refcount(), 1);
    assert_eq!(h.scheduler.queue(queue).unwrap().todo_refcount(), 1);

    // No spare concurrency while the first entry is out.
    assert_eq!(h.scheduler.select(), None);
    assert_eq!(h.dispatch(), None);

    let report = delivered(&h, first);
    h.scheduler.delivery_done(first, report);

    let second = h.dispatch().expect("second entry follows");
    assert_eq!(h.scheduler.entry(second).unwrap().message(), second_message);
}

#[test]
fn scenario_b_connect_failure_blocks_transport_until_retry() {
    let mut h = Harness::with(|c| c.transport_retry_time_secs = 60);
    h.shared.lock().unreachable.push("smtp".to_string());
    h.admit("MSG1", &[("smtp", "example.com", "a@example.com")]);
    let smtp = h.transport("smtp");

    assert_eq!(h.scheduler.select(), Some(smtp));
    let notify = h.notify();
    h.scheduler.alloc(smtp, notify);
    assert!(h.scheduler.transport(smtp).unwrap().is_dead());
    assert_eq!(
        h.scheduler.transport(smtp).unwrap().dsn(),
        Some(&Dsn::new("4.3.0", "mail transport unavailable"))
    );

    // The failed request still reports back, with no connection.
    h.advance(Duration::ZERO);
    assert_eq!(h.shared.lock().selected, vec![None]);
    assert_eq!(h.scheduler.transport(smtp).unwrap().pending(), 0);

    for _ in 0..59 {
        assert_eq!(h.scheduler.select(), None);
        h.advance(Duration::from_secs(1));
    }
    assert_eq!(h.scheduler.select(), None);

    h.advance(Duration::from_secs(1));
    assert!(!h.scheduler.transport(smtp).unwrap().is_dead());
    assert_eq!(h.scheduler.select(), Some(smtp));
}

#[test]
fn scenario_c_enable_collects_only_empty_queues() {
    let mut h = Harness::default_config();
    let smtp = h.scheduler.obtain_transport("smtp");
    let empty = h.scheduler.obtain_queue(smtp, "empty.example");
    h.admit("MSG1", &[("smtp", "busy.example", "a@busy.example")]);
    let waiting = h.queue("smtp", "busy.example").unwrap();

    h.scheduler.enable_queue(empty);
    assert_eq!(h.queue("smtp", "empty.example"), None);
    assert!(h.scheduler.queue(empty).is_none());

    h.scheduler.enable_queue(waiting);
    assert_eq!(h.queue("smtp", "busy.example"), Some(waiting));
    assert_eq!(h.scheduler.queue(waiting).unwrap().todo_refcount(), 1);
}

#[test]
fn scenario_d_throttled_queue_moves_waiting_entries_to_retry() {
    let mut h = Harness::with(|c| {
        c.init_dest_concurrency = 1;
        c.conc_cohort_limit = 1;
        c.recipient_limit = 1;
    });
    h.admit(
        "MSG1",
        &[
            ("smtp", "down.example", "a@down.example"),
            ("smtp", "down.example", "b@down.example"),
            ("smtp", "down.example", "c@down.example"),
            ("smtp", "down.example", "d@down.example"),
        ],
    );
    let queue = h.queue("smtp", "down.example").unwrap();
    assert_eq!(h.scheduler.queue(queue).unwrap().todo_refcount(), 4);

    let entry = h.dispatch().unwrap();
    let report = site_failure(&h, entry, &refused());
    h.scheduler.delivery_done(entry, report);

    let down = h.scheduler.queue(queue).unwrap();
    assert_eq!(down.window(), Window::Throttled);
    assert_eq!(down.dsn(), Some(&refused()));
    assert_eq!(down.todo_refcount(), 0);
    assert_eq!(down.busy_refcount(), 0);

    let retry = h.queue("retry", "4.4.1 connection refused").unwrap();
    assert_eq!(h.scheduler.queue(retry).unwrap().todo_refcount(), 3);

    // Only the attempted recipient was logged; the rest travel on.
    assert_eq!(h.shared.lock().defers.len(), 1);
    assert!(h.shared.lock().released.is_empty());
}

#[test]
fn defer_todo_falls_back_to_defer_log_when_retry_is_down() {
    let mut h = Harness::with(|c| c.recipient_limit = 1);
    h.admit(
        "MSG1",
        &[
            ("smtp", "down.example", "a@down.example"),
            ("smtp", "down.example", "b@down.example"),
            ("smtp", "down.example", "c@down.example"),
        ],
    );
    let retry = h.scheduler.obtain_transport("retry");
    h.scheduler
        .throttle_transport(retry, Dsn::new("4.3.0", "mail transport unavailable"));

    let queue = h.queue("smtp", "down.example").unwrap();
    h.scheduler.defer_todo(queue, &refused());

    let shared = h.shared.lock();
    assert_eq!(shared.defers.len(), 3);
    assert!(shared.defers.iter().all(|r| r.status == "4.4.1" && r.relay == "none"));
    assert_eq!(shared.released, vec![("MSG1".to_string(), DeliverFlags::DEFER)]);
    drop(shared);

    // Ready and empty after the deferral: collected.
    assert_eq!(h.queue("smtp", "down.example"), None);
}

#[test]
fn pending_connections_never_exceed_pipeline_depth() {
    let mut h = Harness::default_config();
    for id in ["MSG1", "MSG2", "MSG3", "MSG4"] {
        h.admit(id, &[("smtp", "example.com", "a@example.com")]);
    }
    let smtp = h.transport("smtp");

    for _ in 0..PIPELINE_DEPTH {
        assert_eq!(h.scheduler.select(), Some(smtp));
        let notify = h.notify();
        h.scheduler.alloc(smtp, notify);
    }

    assert_eq!(h.scheduler.transport(smtp).unwrap().pending(), PIPELINE_DEPTH);
    assert_eq!(h.scheduler.select(), None);
    assert_eq!(h.scheduler.timers().len(), 2);
}

#[test]
#[should_panic(expected = "excess allocation")]
fn alloc_beyond_pipeline_depth_panics() {
    let mut h = Harness::default_config();
    let smtp = h.scheduler.obtain_transport("smtp");
    for _ in 0..=PIPELINE_DEPTH {
        let notify = h.notify();
        h.scheduler.alloc(smtp, notify);
    }
}

#[test]
#[should_panic(expected = "dead or rate locked")]
fn alloc_on_dead_transport_panics() {
    let mut h = Harness::default_config();
    let smtp = h.scheduler.obtain_transport("smtp");
    h.scheduler
        .throttle_transport(smtp, Dsn::new("4.3.0", "mail transport unavailable"));
    let notify = h.notify();
    h.scheduler.alloc(smtp, notify);
}

#[test]
fn select_is_round_robin() {
    let mut h = Harness::default_config();
    h.admit("MSG1", &[("alpha", "example.com", "a@example.com")]);
    h.admit("MSG2", &[("beta", "example.com", "b@example.com")]);
    h.admit("MSG3", &[("gamma", "example.com", "c@example.com")]);
    let expected = vec![h.transport("alpha"), h.transport("beta"), h.transport("gamma")];

    let first_round: Vec<_> = (0..3).map(|_| h.scheduler.select().unwrap()).collect();
    let second_round: Vec<_> = (0..3).map(|_| h.scheduler.select().unwrap()).collect();

    assert_eq!(first_round, expected);
    assert_eq!(second_round, expected);
}

#[test]
fn throttle_and_unthrottle_are_idempotent() {
    let mut h = Harness::default_config();
    let smtp = h.scheduler.obtain_transport("smtp");
    let dsn = Dsn::new("4.3.0", "mail transport unavailable");

    h.scheduler.throttle_transport(smtp, dsn.clone());
    h.advance(Duration::from_secs(10));
    h.scheduler
        .throttle_transport(smtp, Dsn::new("4.3.0", "another reason"));

    let timer = TimerKey::TransportUnthrottle(smtp);
    assert_eq!(h.scheduler.timers().len(), 1);
    assert_eq!(h.scheduler.timers().deadline(timer), Some(Duration::from_secs(60)));
    assert_eq!(h.scheduler.transport(smtp).unwrap().dsn(), Some(&dsn));

    h.scheduler.unthrottle_transport(smtp);
    h.scheduler.unthrottle_transport(smtp);
    assert!(h.scheduler.timers().is_empty());
    assert!(!h.scheduler.transport(smtp).unwrap().is_dead());
}

#[test]
fn transport_rate_delay_holds_the_connection() {
    let mut h = Harness::with(|c| {
        c.transports.insert(
            "smtp".to_string(),
            TransportOverrides {
                xport_rate_delay_secs: Some(5),
                ..TransportOverrides::default()
            },
        );
    });
    h.admit("MSG1", &[("smtp", "example.com", "a@example.com")]);
    h.admit("MSG2", &[("smtp", "example.com", "b@example.com")]);
    let smtp = h.transport("smtp");

    assert_eq!(h.scheduler.select(), Some(smtp));
    let notify = h.notify();
    let alloc = h.scheduler.alloc(smtp, notify);
    assert!(h.scheduler.transport(smtp).unwrap().is_rate_locked());

    h.scheduler.connect_complete(alloc, Ok(support::Stream));
    assert!(h.shared.lock().selected.is_empty());
    assert_eq!(h.scheduler.select(), None);

    h.advance(Duration::from_secs(5));
    assert!(!h.scheduler.transport(smtp).unwrap().is_rate_locked());
    assert_eq!(h.shared.lock().selected.len(), 1);
    assert!(h.shared.lock().selected[0].is_some());
    assert_eq!(h.scheduler.select(), Some(smtp));
}

#[test]
fn late_connect_failure_throttles_and_releases_the_rate_lock() {
    let mut h = Harness::with(|c| {
        c.transport_retry_time_secs = 60;
        c.transports.insert(
            "smtp".to_string(),
            TransportOverrides {
                xport_rate_delay_secs: Some(1),
                ..TransportOverrides::default()
            },
        );
    });
    h.admit("MSG1", &[("smtp", "example.com", "a@example.com")]);
    let smtp = h.transport("smtp");

    assert_eq!(h.scheduler.select(), Some(smtp));
    let notify = h.notify();
    let alloc = h.scheduler.alloc(smtp, notify);
    h.scheduler.connect_complete(
        alloc,
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        )),
    );

    assert_eq!(h.shared.lock().selected, vec![None]);
    let transport = h.scheduler.transport(smtp).unwrap();
    assert!(transport.is_dead());
    assert_eq!(transport.pending(), 0);
    assert_eq!(
        transport.dsn(),
        Some(&Dsn::new("4.3.0", "mail transport unavailable"))
    );
    assert_eq!(h.scheduler.select(), None);

    h.advance(Duration::from_secs(60));
    let transport = h.scheduler.transport(smtp).unwrap();
    assert!(!transport.is_dead());
    assert!(!transport.is_rate_locked());
    assert_eq!(h.scheduler.select(), Some(smtp));
}

#[test]
fn stuck_agent_listener_is_fatal() {
    let mut h = Harness::default_config();
    h.admit("MSG1", &[("smtp", "example.com", "a@example.com")]);
    let smtp = h.scheduler.select().unwrap();
    let notify = h.notify();
    h.scheduler.alloc(smtp, notify);

    h.clock.advance(Duration::from_secs(h.scheduler.config().daemon_timeout_secs));
    let err = h.scheduler.run_timers().unwrap_err();
    assert!(matches!(err, QmgrError::ConnectTimeout { ref transport } if transport == "smtp"));
    assert!(err.is_fatal());
}

#[test]
fn completion_cancels_the_watchdog() {
    let mut h = Harness::default_config();
    h.admit("MSG1", &[("smtp", "example.com", "a@example.com")]);

    let entry = h.dispatch().unwrap();
    assert!(h.scheduler.timers().is_empty());

    h.clock.advance(Duration::from_secs(h.scheduler.config().daemon_timeout_secs));
    h.scheduler.run_timers().unwrap();
    let report = delivered(&h, entry);
    h.scheduler.delivery_done(entry, report);
}
