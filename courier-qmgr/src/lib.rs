//! Delivery scheduling core of the courier queue manager.
//!
//! Queue files are admitted from the spool into an in-core object graph of
//! transports, destination queues, jobs, peers and entries. The [`Scheduler`]
//! decides which transport gets the next delivery-agent connection and which
//! entry travels over it, adjusts per-destination concurrency from delivery
//! feedback, throttles failing destinations and transports, and turns
//! undeliverable recipients into bounces and deferrals.
//!
//! [`QmgrService`] runs a scheduler on tokio against a spool directory.

mod arena;
mod list;

pub mod clock;
pub mod config;
pub mod connect;
pub mod disposition;
mod enable;
pub mod error;
pub mod feedback;
pub mod model;
mod redirect;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod timer;

pub use arena::Key;
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{QmgrConfig, TransportOverrides, TransportSettings};
pub use connect::{AllocId, ConnectEvent, Connector, UnixConnector};
pub use disposition::{FileRecipientLog, LogRecord, RecipientLog};
pub use error::{ConfigError, LogError, QmgrError};
pub use feedback::Feedback;
pub use scheduler::{
    Admission, AgentStatus, Collaborators, DeliveryReport, DeliveryRequest, Notify,
    PIPELINE_DEPTH, RecipientStatus, Scheduler,
};
pub use service::{DeliveryAgent, QmgrService, Trigger, TriggerQueue};
pub use source::{LoadedMessage, MessageSource};
pub use timer::{TimerKey, TimerTable};
