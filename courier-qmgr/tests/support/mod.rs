//! Collaborator fakes and a driver for scheduler tests
#![allow(dead_code)] // Not every test file uses every helper
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{
    io,
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime},
};

use courier_qmgr::{
    Admission, AllocId, Clock, Collaborators, Connector, LoadedMessage, LogError, LogRecord,
    ManualClock, MessageSource, Notify, QmgrConfig, QmgrError, RecipientLog, Scheduler,
    model::{
        DeliverFlags, EntryKey, MessageKey, QueueKey, Recipient, RoutedRecipient, TransportKey,
    },
};
use courier_spool::QueueId;
use parking_lot::Mutex;

/// Stand-in for a delivery agent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream;

/// Everything the fakes observed
#[derive(Debug, Default)]
pub struct Recorded {
    pub connects: Vec<(String, AllocId)>,
    /// Services whose connections fail immediately
    pub unreachable: Vec<String>,
    pub completed: Vec<(String, u64)>,
    pub released: Vec<(String, DeliverFlags)>,
    pub bounces: Vec<LogRecord>,
    pub defers: Vec<LogRecord>,
    pub fail_bounce_log: bool,
    /// Entries handed out by connection callbacks, `None` for a failed connect
    pub selected: Vec<Option<EntryKey>>,
}

pub type Shared = Arc<Mutex<Recorded>>;

pub struct FakeConnector(pub Shared);

impl Connector for FakeConnector {
    fn connect(&mut self, service: &str, alloc: AllocId) -> io::Result<()> {
        let mut shared = self.0.lock();
        shared.connects.push((service.to_string(), alloc));
        if shared.unreachable.iter().any(|s| s == service) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        Ok(())
    }
}

pub struct BounceLog(pub Shared);

impl RecipientLog for BounceLog {
    fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let mut shared = self.0.lock();
        if shared.fail_bounce_log {
            return Err(io::Error::other("bounce log unavailable").into());
        }
        shared.bounces.push(record.clone());
        Ok(())
    }
}

pub struct DeferLog(pub Shared);

impl RecipientLog for DeferLog {
    fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        self.0.lock().defers.push(record.clone());
        Ok(())
    }
}

/// Reads queue files made of `transport nexthop address` lines. A recipient's
/// offset is its line number.
pub struct LineSource(pub Shared);

impl MessageSource for LineSource {
    fn load(&mut self, _queue_id: &QueueId, path: &Path) -> Result<LoadedMessage, QmgrError> {
        let content = std::fs::read_to_string(path)?;
        let recipients = content
            .lines()
            .enumerate()
            .map(|(offset, line)| {
                let mut fields = line.split_whitespace();
                match (fields.next(), fields.next(), fields.next()) {
                    (Some(transport), Some(nexthop), Some(address)) => Ok(RoutedRecipient::new(
                        Recipient::new(offset as u64, address),
                        transport,
                        nexthop,
                    )),
                    _ => Err(QmgrError::Source(format!("malformed line {offset}"))),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LoadedMessage {
            arrival: SystemTime::now(),
            recipients,
        })
    }

    fn mark_completed(&mut self, queue_id: &QueueId, offset: u64) -> Result<(), QmgrError> {
        self.0.lock().completed.push((queue_id.to_string(), offset));
        Ok(())
    }

    fn release(&mut self, queue_id: &QueueId, flags: DeliverFlags) {
        self.0.lock().released.push((queue_id.to_string(), flags));
    }
}

/// A scheduler on a manual clock with recording collaborators
pub struct Harness {
    pub scheduler: Scheduler<Stream>,
    pub clock: Arc<ManualClock>,
    pub shared: Shared,
}

impl Harness {
    pub fn new(config: QmgrConfig) -> Self {
        let shared = Shared::default();
        let clock = Arc::new(ManualClock::new());
        let scheduler = Scheduler::new(
            config,
            Collaborators {
                clock: clock.clone() as Arc<dyn Clock>,
                connector: Box::new(FakeConnector(shared.clone())),
                source: Box::new(LineSource(shared.clone())),
                bounce_log: Box::new(BounceLog(shared.clone())),
                defer_log: Box::new(DeferLog(shared.clone())),
            },
        )
        .unwrap();

        Self {
            scheduler,
            clock,
            shared,
        }
    }

    pub fn default_config() -> Self {
        Self::new(QmgrConfig::default())
    }

    pub fn with(f: impl FnOnce(&mut QmgrConfig)) -> Self {
        let mut config = QmgrConfig::default();
        f(&mut config);
        Self::new(config)
    }

    /// Move the clock and fire due timers
    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.scheduler.run_timers().unwrap();
    }

    /// Admit a message whose recipients are `(transport, nexthop, address)`
    pub fn admit(&mut self, id: &str, recipients: &[(&str, &str, &str)]) -> MessageKey {
        self.admit_with(id, recipients, false)
    }

    pub fn admit_with(
        &mut self,
        id: &str,
        recipients: &[(&str, &str, &str)],
        override_defer_transports: bool,
    ) -> MessageKey {
        let recipients = recipients
            .iter()
            .zip(0..)
            .map(|((transport, nexthop, address), offset)| {
                RoutedRecipient::new(Recipient::new(offset, *address), transport, nexthop)
            })
            .collect();

        self.scheduler.admit(Admission {
            queue_id: QueueId::parse(id).unwrap(),
            arrival: SystemTime::now(),
            recipients,
            override_defer_transports,
        })
    }

    /// A connection callback that selects an entry and records it
    pub fn notify(&self) -> Notify<Stream> {
        let shared = self.shared.clone();
        Box::new(
            move |scheduler: &mut Scheduler<Stream>,
                  transport: TransportKey,
                  stream: Option<Stream>| {
                let entry = stream.and_then(|_| scheduler.select_entry(transport));
                shared.lock().selected.push(entry);
            },
        )
    }

    /// Select a transport, connect to it and pick an entry for the connection
    pub fn dispatch(&mut self) -> Option<EntryKey> {
        let transport = self.scheduler.select()?;
        let notify = self.notify();
        let alloc = self.scheduler.alloc(transport, notify);
        if self.scheduler.transport(transport).unwrap().is_dead() {
            return None;
        }

        self.scheduler.connect_complete(alloc, Ok(Stream));
        self.shared.lock().selected.pop().flatten()
    }

    pub fn transport(&self, name: &str) -> TransportKey {
        self.scheduler.find_transport(name).unwrap()
    }

    pub fn queue(&self, transport: &str, nexthop: &str) -> Option<QueueKey> {
        self.scheduler.find_queue(self.transport(transport), nexthop)
    }
}
