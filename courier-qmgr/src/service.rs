//! The queue manager's event loop.
//!
//! [`QmgrService`] owns a [`Scheduler`] and drives it from one tokio task:
//! it feeds due queue files from the incoming and deferred queues into the
//! active queue, opens connections for the transports the scheduler selects,
//! runs delivery agents on those connections and hands their reports back.

use std::{
    io,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use courier_common::{Dsn, Signal, internal, logging};
use courier_spool::{
    FsDirectory, QueueId, QueueScan, ScanEntry, ScanFlags, SpoolConfig, SpoolError, move_entry,
    move_queue, queues,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinSet,
};
use tracing::{debug, error, warn};

use crate::{
    clock::TokioClock,
    config::QmgrConfig,
    connect::{ConnectEvent, Connector},
    disposition::FileRecipientLog,
    error::QmgrError,
    model::{EntryKey, TransportKey},
    scheduler::{Admission, Collaborators, DeliveryReport, DeliveryRequest, Notify, Scheduler},
    source::MessageSource,
};

/// In-flight deliveries get this long to finish after a shutdown signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs one delivery transaction over a connected stream
#[async_trait]
pub trait DeliveryAgent<S: Send + 'static>: Send + Sync + 'static {
    async fn deliver(&self, stream: S, request: DeliveryRequest) -> DeliveryReport;
}

/// Which queue directory a trigger asks to scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerQueue {
    Incoming,
    Deferred,
}

/// A request to scan a queue, as sent by `postqueue -f` style tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub queue: TriggerQueue,
    pub flags: ScanFlags,
}

struct Dispatch<S> {
    entry: EntryKey,
    request: DeliveryRequest,
    stream: S,
}

pub struct QmgrService<S, A> {
    scheduler: Scheduler<S>,
    spool: SpoolConfig,
    clock: Arc<TokioClock>,
    active_limit: usize,
    queue_run_delay: Duration,
    incoming: QueueScan<FsDirectory>,
    deferred: QueueScan<FsDirectory>,
    connect_events: mpsc::UnboundedReceiver<ConnectEvent<S>>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch<S>>,
    dispatch_rx: mpsc::UnboundedReceiver<Dispatch<S>>,
    trigger_tx: mpsc::UnboundedSender<Trigger>,
    trigger_rx: mpsc::UnboundedReceiver<Trigger>,
    agent: Arc<A>,
    deliveries: JoinSet<(EntryKey, DeliveryReport)>,
}

impl<S, A> QmgrService<S, A>
where
    S: Send + 'static,
    A: DeliveryAgent<S>,
{
    /// Build the service over an initialised spool.
    ///
    /// Bounce and defer records go to the spool's `bounce` and `defer`
    /// directories.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration or a spool whose
    /// directories cannot be created.
    pub fn new(
        config: QmgrConfig,
        spool: SpoolConfig,
        connector: Box<dyn Connector>,
        connect_events: mpsc::UnboundedReceiver<ConnectEvent<S>>,
        source: Box<dyn MessageSource>,
        agent: A,
    ) -> Result<Self, QmgrError> {
        spool.init()?;

        let clock = Arc::new(TokioClock::new());
        let active_limit = config.active_limit;
        let queue_run_delay = Duration::from_secs(config.queue_run_delay_secs.max(1));
        let scheduler = Scheduler::new(
            config,
            Collaborators {
                clock: clock.clone(),
                connector,
                source,
                bounce_log: Box::new(FileRecipientLog::new(spool.queue_path(queues::BOUNCE)?)),
                defer_log: Box::new(FileRecipientLog::new(spool.queue_path(queues::DEFER)?)),
            },
        )?;

        let directory = FsDirectory::new(spool.clone());
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();

        Ok(Self {
            scheduler,
            spool,
            clock,
            active_limit,
            queue_run_delay,
            incoming: QueueScan::new(directory.clone(), queues::INCOMING),
            deferred: QueueScan::new(directory, queues::DEFERRED),
            connect_events,
            dispatch_tx,
            dispatch_rx,
            trigger_tx,
            trigger_rx,
            agent: Arc::new(agent),
            deliveries: JoinSet::new(),
        })
    }

    /// A handle for requesting queue scans while the service runs
    pub fn triggers(&self) -> mpsc::UnboundedSender<Trigger> {
        self.trigger_tx.clone()
    }

    pub const fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    /// Run until a shutdown signal arrives or a fatal error occurs.
    ///
    /// Installs the configured log subscriber unless one is already set.
    /// Queue files left in the active queue by a previous run go back to the
    /// incoming queue first, since in-core state did not survive.
    ///
    /// # Errors
    ///
    /// Returns an error if a delivery agent listener is stuck or the spool
    /// becomes unusable.
    pub async fn serve(mut self, mut shutdown: broadcast::Receiver<Signal>) -> anyhow::Result<()> {
        logging::init(&self.scheduler.config().log);
        internal!(level = INFO, "Queue manager starting");

        let recovered = move_queue(&self.spool, queues::ACTIVE, queues::INCOMING, None)?;
        if recovered.moved > 0 {
            internal!(level = INFO, "Recovered {} messages from the active queue", recovered.moved);
        }

        self.incoming.request(ScanFlags::empty())?;
        self.deferred.request(ScanFlags::empty())?;

        let mut queue_run = tokio::time::interval(self.queue_run_delay);
        queue_run.tick().await;

        loop {
            self.scheduler.run_timers()?;
            self.scheduler.refill();
            self.feed()?;
            self.schedule();
            self.dispatch();

            let wake = self
                .scheduler
                .next_deadline()
                .map(|at| self.clock.instant(at));

            tokio::select! {
                Some((alloc, result)) = self.connect_events.recv() => {
                    self.scheduler.connect_complete(alloc, result);
                }
                Some(done) = self.deliveries.join_next() => {
                    self.delivered(done);
                }
                Some(trigger) = self.trigger_rx.recv() => {
                    self.trigger(trigger)?;
                }
                () = sleep_until(wake) => {}
                _ = queue_run.tick() => {
                    self.deferred.request(ScanFlags::empty())?;
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Queue manager received shutdown signal");
                        }
                        Err(err) => {
                            error!("Queue manager shutdown channel error: {err}");
                        }
                    }
                    break;
                }
            }
        }

        self.drain().await;
        internal!(level = INFO, "Queue manager stopped");
        Ok(())
    }

    /// Move due queue files into the active queue and admit them, up to the
    /// in-core message limit.
    fn feed(&mut self) -> Result<(), QmgrError> {
        while self.scheduler.message_count() < self.active_limit {
            let (entry, flags) = if let Some(entry) = self.incoming.next()? {
                (entry, self.incoming.flags())
            } else if let Some(entry) = self.deferred.next()? {
                (entry, self.deferred.flags())
            } else {
                break;
            };

            self.activate(entry, flags)?;
        }

        Ok(())
    }

    fn activate(&mut self, entry: ScanEntry, flags: ScanFlags) -> Result<(), QmgrError> {
        let Some(queue_id) = QueueId::parse(&entry.name) else {
            warn!("ignoring {}: not a queue file", entry.path.display());
            return Ok(());
        };

        match entry.is_due(flags, SystemTime::now()) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let path = match move_entry(&self.spool, &entry, queues::ACTIVE) {
            Ok(path) => path,
            Err(SpoolError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                debug!(%queue_id, "queue file vanished before activation");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match self.scheduler.source_mut().load(&queue_id, &path) {
            Ok(loaded) => {
                self.scheduler.admit(Admission {
                    queue_id,
                    arrival: loaded.arrival,
                    recipients: loaded.recipients,
                    override_defer_transports: flags.contains(ScanFlags::OVERRIDE_DEFER_TRANSPORTS),
                });
            }
            Err(err) => {
                warn!(%queue_id, "cannot load queue file, moving to corrupt: {err}");
                let active = ScanEntry {
                    name: entry.name,
                    path,
                };
                move_entry(&self.spool, &active, queues::CORRUPT)?;
            }
        }

        Ok(())
    }

    /// Open a connection for every transport that can use one
    fn schedule(&mut self) {
        while let Some(transport) = self.scheduler.select() {
            let notify = self.notify();
            self.scheduler.alloc(transport, notify);
        }
    }

    fn notify(&self) -> Notify<S> {
        let dispatch = self.dispatch_tx.clone();

        Box::new(move |scheduler: &mut Scheduler<S>, transport: TransportKey, stream: Option<S>| {
            let Some(stream) = stream else {
                let dsn = Dsn::new("4.3.0", "mail transport unavailable");
                scheduler.throttle_transport(transport, dsn.clone());
                scheduler.defer_transport(transport, &dsn);
                return;
            };

            // The connection is dropped when nothing became deliverable meanwhile.
            let Some(entry) = scheduler.select_entry(transport) else {
                return;
            };
            let request = scheduler.delivery_request(entry);
            if dispatch
                .send(Dispatch {
                    entry,
                    request,
                    stream,
                })
                .is_err()
            {
                error!("delivery dispatch channel closed");
            }
        })
    }

    /// Start a delivery task for every entry selected since the last pass
    fn dispatch(&mut self) {
        while let Ok(Dispatch {
            entry,
            request,
            stream,
        }) = self.dispatch_rx.try_recv()
        {
            let agent = Arc::clone(&self.agent);
            self.deliveries.spawn(async move {
                let attempt = tokio::spawn(async move { agent.deliver(stream, request).await });
                let report = match attempt.await {
                    Ok(report) => report,
                    Err(err) => {
                        error!("delivery agent task failed: {err}");
                        DeliveryReport::crashed()
                    }
                };
                (entry, report)
            });
        }
    }

    fn delivered(&mut self, done: Result<(EntryKey, DeliveryReport), tokio::task::JoinError>) {
        match done {
            Ok((entry, report)) => self.scheduler.delivery_done(entry, report),
            Err(err) => error!("delivery task failed: {err}"),
        }
    }

    fn trigger(&mut self, trigger: Trigger) -> Result<(), QmgrError> {
        debug!(?trigger, "scan requested");

        if trigger.flags.contains(ScanFlags::FLUSH_DEAD) {
            self.scheduler.enable_all();
        }

        match trigger.queue {
            TriggerQueue::Incoming => self.incoming.request(trigger.flags)?,
            TriggerQueue::Deferred => self.deferred.request(trigger.flags)?,
        }
        Ok(())
    }

    /// Let in-flight deliveries finish, up to [`SHUTDOWN_TIMEOUT`]
    async fn drain(&mut self) {
        if self.deliveries.is_empty() {
            return;
        }
        internal!("Waiting for {} in-flight deliveries", self.deliveries.len());

        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        while !self.deliveries.is_empty() {
            match tokio::time::timeout_at(deadline, self.deliveries.join_next()).await {
                Ok(Some(done)) => self.delivered(done),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Shutdown timeout exceeded, {} in-flight deliveries will be retried on restart",
                        self.deliveries.len()
                    );
                    self.deliveries.shutdown().await;
                    break;
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
