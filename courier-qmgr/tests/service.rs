#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{fs, io, time::Duration};

use async_trait::async_trait;
use courier_common::Signal;
use courier_qmgr::{
    AllocId, ConnectEvent, Connector, DeliveryAgent, DeliveryReport, DeliveryRequest, QmgrConfig,
    QmgrService, Trigger, TriggerQueue, model::DeliverFlags,
};
use courier_spool::{ScanFlags, SpoolConfig, queues};
use support::{LineSource, Shared, Stream};
use tokio::sync::{broadcast, mpsc};

/// Connects every request at once
struct InstantConnector(mpsc::UnboundedSender<ConnectEvent<Stream>>);

impl Connector for InstantConnector {
    fn connect(&mut self, _service: &str, alloc: AllocId) -> io::Result<()> {
        self.0
            .send((alloc, Ok(Stream)))
            .map_err(|_| io::Error::other("scheduler gone"))
    }
}

struct AcceptAll;

#[async_trait]
impl DeliveryAgent<Stream> for AcceptAll {
    async fn deliver(&self, _stream: Stream, request: DeliveryRequest) -> DeliveryReport {
        DeliveryReport::delivered(&request)
    }
}

async fn released(shared: &Shared, queue_id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if shared.lock().released.iter().any(|(id, _)| id == queue_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message was not released in time");
}

fn service(spool: &SpoolConfig, shared: &Shared) -> QmgrService<Stream, AcceptAll> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    QmgrService::new(
        QmgrConfig::default(),
        spool.clone(),
        Box::new(InstantConnector(events_tx)),
        events_rx,
        Box::new(LineSource(shared.clone())),
        AcceptAll,
    )
    .unwrap()
}

#[tokio::test]
async fn delivers_incoming_mail_and_shuts_down() {
    let temp = tempfile::tempdir().unwrap();
    let spool = SpoolConfig::new(temp.path()).unwrap();
    spool.init().unwrap();
    fs::write(
        spool.queue_path(queues::INCOMING).unwrap().join("MSG1"),
        "local example.com user@example.com\nlocal example.com other@example.com\n",
    )
    .unwrap();

    let shared = Shared::default();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(service(&spool, &shared).serve(shutdown_rx));

    released(&shared, "MSG1").await;
    {
        let shared = shared.lock();
        assert_eq!(
            shared.released,
            vec![("MSG1".to_string(), DeliverFlags::empty())]
        );
        assert_eq!(shared.completed.len(), 2);
    }
    assert!(
        spool
            .queue_path(queues::ACTIVE)
            .unwrap()
            .join("MSG1")
            .exists()
    );

    shutdown_tx.send(Signal::Shutdown).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn recovers_active_queue_and_honours_triggers() {
    let temp = tempfile::tempdir().unwrap();
    let spool = SpoolConfig::new(temp.path()).unwrap();
    spool.init().unwrap();
    fs::write(
        spool.queue_path(queues::ACTIVE).unwrap().join("LEFTOVER"),
        "local example.com user@example.com\n",
    )
    .unwrap();

    let shared = Shared::default();
    let service = service(&spool, &shared);
    let triggers = service.triggers();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(service.serve(shutdown_rx));

    released(&shared, "LEFTOVER").await;

    // A file that is not due yet only moves with a timestamp-ignoring scan.
    let deferred = spool.queue_path(queues::DEFERRED).unwrap().join("LATER");
    fs::write(&deferred, "local example.com user@example.com\n").unwrap();
    fs::File::options()
        .write(true)
        .open(&deferred)
        .unwrap()
        .set_modified(std::time::SystemTime::now() + Duration::from_secs(3600))
        .unwrap();

    triggers
        .send(Trigger {
            queue: TriggerQueue::Deferred,
            flags: ScanFlags::IGNORE_TIMESTAMPS,
        })
        .unwrap();
    released(&shared, "LATER").await;

    shutdown_tx.send(Signal::Shutdown).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn corrupt_queue_file_is_set_aside() {
    let temp = tempfile::tempdir().unwrap();
    let spool = SpoolConfig::new(temp.path()).unwrap();
    spool.init().unwrap();
    fs::write(
        spool.queue_path(queues::INCOMING).unwrap().join("BROKEN"),
        "garbage\n",
    )
    .unwrap();

    let shared = Shared::default();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(service(&spool, &shared).serve(shutdown_rx));

    let corrupt = spool.queue_path(queues::CORRUPT).unwrap().join("BROKEN");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !corrupt.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue file was not moved to corrupt");

    shutdown_tx.send(Signal::Shutdown).unwrap();
    handle.await.unwrap().unwrap();
    assert!(shared.lock().released.is_empty());
}
