use std::{path::PathBuf, time::Duration};

use ahash::AHashMap;
use courier_common::LogConfig;
use serde::Deserialize;

use crate::{error::ConfigError, feedback::Feedback};

mod defaults {
    use crate::feedback::Feedback;

    pub const fn dest_concurrency_limit() -> u32 {
        20
    }

    pub const fn init_dest_concurrency() -> u32 {
        5
    }

    pub const fn recipient_limit() -> u32 {
        50
    }

    pub const fn xport_rcpt_limit() -> u32 {
        20000
    }

    pub const fn stack_rcpt_limit() -> u32 {
        1000
    }

    pub const fn xport_refill_limit() -> u32 {
        100
    }

    pub const fn xport_refill_delay() -> u64 {
        5
    }

    pub const fn delivery_slot_cost() -> u32 {
        5
    }

    pub const fn delivery_slot_loan() -> u32 {
        3
    }

    pub const fn delivery_slot_discount() -> u32 {
        50
    }

    pub const fn min_delivery_slots() -> u32 {
        3
    }

    pub const fn feedback() -> Feedback {
        Feedback::Constant(1.0)
    }

    pub const fn conc_cohort_limit() -> u32 {
        1
    }

    pub const fn transport_retry_time() -> u64 {
        60
    }

    pub const fn min_backoff_time() -> u64 {
        300
    }

    pub const fn daemon_timeout() -> u64 {
        18000
    }

    pub const fn active_limit() -> usize {
        20000
    }

    pub const fn queue_run_delay() -> u64 {
        300
    }

    pub fn error_service() -> String {
        "error".to_string()
    }

    pub fn retry_service() -> String {
        "retry".to_string()
    }

    pub fn service_dir() -> std::path::PathBuf {
        std::path::PathBuf::from("/var/spool/courier/private")
    }
}

/// Per-transport overrides of the global scheduling options
///
/// ```ron
/// transports: {
///     "smtp": (dest_concurrency_limit: Some(10), dest_rate_delay_secs: Some(1)),
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportOverrides {
    pub dest_concurrency_limit: Option<u32>,
    pub init_dest_concurrency: Option<u32>,
    pub recipient_limit: Option<u32>,
    pub xport_rcpt_limit: Option<u32>,
    pub stack_rcpt_limit: Option<u32>,
    pub xport_refill_limit: Option<u32>,
    pub xport_refill_delay_secs: Option<u64>,
    pub xport_rate_delay_secs: Option<u64>,
    pub dest_rate_delay_secs: Option<u64>,
    pub delivery_slot_cost: Option<u32>,
    pub delivery_slot_loan: Option<u32>,
    pub delivery_slot_discount: Option<u32>,
    pub min_delivery_slots: Option<u32>,
    pub conc_positive_feedback: Option<Feedback>,
    pub conc_negative_feedback: Option<Feedback>,
    pub conc_cohort_limit: Option<u32>,
}

/// Queue manager configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QmgrConfig {
    /// Maximum window of one destination queue (0 = unlimited)
    #[serde(default = "defaults::dest_concurrency_limit")]
    pub dest_concurrency_limit: u32,

    /// Window of a new or recovered destination queue
    #[serde(default = "defaults::init_dest_concurrency")]
    pub init_dest_concurrency: u32,

    /// Recipients per delivery request (0 = unlimited)
    #[serde(default = "defaults::recipient_limit")]
    pub recipient_limit: u32,

    /// In-core recipients per transport, shared by all its jobs
    #[serde(default = "defaults::xport_rcpt_limit")]
    pub xport_rcpt_limit: u32,

    /// In-core recipients every job may hold regardless of the shared pool
    #[serde(default = "defaults::stack_rcpt_limit")]
    pub stack_rcpt_limit: u32,

    /// Freed recipient slots that trigger reading in more recipients
    #[serde(default = "defaults::xport_refill_limit")]
    pub xport_refill_limit: u32,

    /// Longest wait between recipient read-ins (in seconds)
    #[serde(default = "defaults::xport_refill_delay")]
    pub xport_refill_delay_secs: u64,

    /// Minimum gap between connections to one transport (in seconds)
    #[serde(default)]
    pub xport_rate_delay_secs: u64,

    /// Minimum gap between deliveries to one destination (in seconds).
    /// Nonzero forces a destination concurrency limit of 1.
    #[serde(default)]
    pub dest_rate_delay_secs: u64,

    #[serde(default = "defaults::delivery_slot_cost")]
    pub delivery_slot_cost: u32,

    #[serde(default = "defaults::delivery_slot_loan")]
    pub delivery_slot_loan: u32,

    /// Percentage of slots a preempting job does not have to pay back
    #[serde(default = "defaults::delivery_slot_discount")]
    pub delivery_slot_discount: u32,

    #[serde(default = "defaults::min_delivery_slots")]
    pub min_delivery_slots: u32,

    #[serde(default = "defaults::feedback")]
    pub conc_positive_feedback: Feedback,

    #[serde(default = "defaults::feedback")]
    pub conc_negative_feedback: Feedback,

    /// Failed pseudo-cohorts after which a destination is throttled (0 = never)
    #[serde(default = "defaults::conc_cohort_limit")]
    pub conc_cohort_limit: u32,

    /// How long a dead transport stays dead (in seconds)
    #[serde(default = "defaults::transport_retry_time")]
    pub transport_retry_time_secs: u64,

    /// How long a throttled destination stays throttled (in seconds)
    #[serde(default = "defaults::min_backoff_time")]
    pub min_backoff_time_secs: u64,

    /// Connect watchdog (in seconds)
    #[serde(default = "defaults::daemon_timeout")]
    pub daemon_timeout_secs: u64,

    /// Maximum number of in-core messages
    #[serde(default = "defaults::active_limit")]
    pub active_limit: usize,

    /// Interval between deferred queue scans (in seconds)
    #[serde(default = "defaults::queue_run_delay")]
    pub queue_run_delay_secs: u64,

    /// Transports whose mail is deferred instead of delivered
    #[serde(default)]
    pub defer_transports: Vec<String>,

    #[serde(default = "defaults::error_service")]
    pub error_service: String,

    #[serde(default = "defaults::retry_service")]
    pub retry_service: String,

    /// Directory holding the delivery agents' listening sockets
    #[serde(default = "defaults::service_dir")]
    pub service_dir: PathBuf,

    #[serde(default)]
    pub transports: AHashMap<String, TransportOverrides>,

    #[serde(default)]
    pub log: LogConfig,
}

impl Default for QmgrConfig {
    fn default() -> Self {
        Self {
            dest_concurrency_limit: defaults::dest_concurrency_limit(),
            init_dest_concurrency: defaults::init_dest_concurrency(),
            recipient_limit: defaults::recipient_limit(),
            xport_rcpt_limit: defaults::xport_rcpt_limit(),
            stack_rcpt_limit: defaults::stack_rcpt_limit(),
            xport_refill_limit: defaults::xport_refill_limit(),
            xport_refill_delay_secs: defaults::xport_refill_delay(),
            xport_rate_delay_secs: 0,
            dest_rate_delay_secs: 0,
            delivery_slot_cost: defaults::delivery_slot_cost(),
            delivery_slot_loan: defaults::delivery_slot_loan(),
            delivery_slot_discount: defaults::delivery_slot_discount(),
            min_delivery_slots: defaults::min_delivery_slots(),
            conc_positive_feedback: defaults::feedback(),
            conc_negative_feedback: defaults::feedback(),
            conc_cohort_limit: defaults::conc_cohort_limit(),
            transport_retry_time_secs: defaults::transport_retry_time(),
            min_backoff_time_secs: defaults::min_backoff_time(),
            daemon_timeout_secs: defaults::daemon_timeout(),
            active_limit: defaults::active_limit(),
            queue_run_delay_secs: defaults::queue_run_delay(),
            defer_transports: Vec::new(),
            error_service: defaults::error_service(),
            retry_service: defaults::retry_service(),
            service_dir: defaults::service_dir(),
            transports: AHashMap::new(),
            log: LogConfig::default(),
        }
    }
}

impl QmgrConfig {
    /// Check every transport's resolved settings
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        TransportSettings::resolve(self, "default")?;
        for name in self.transports.keys() {
            TransportSettings::resolve(self, name)?;
        }
        Ok(())
    }

    pub fn is_deferred_transport(&self, name: &str) -> bool {
        self.defer_transports.iter().any(|t| t == name)
    }
}

/// Scheduling options of one transport, fixed when the transport is created
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    pub dest_concurrency_limit: u32,
    pub init_dest_concurrency: u32,
    pub recipient_limit: u32,
    pub xport_rcpt_limit: u32,
    pub stack_rcpt_limit: u32,
    pub xport_refill_limit: u32,
    pub xport_refill_delay: Duration,
    pub xport_rate_delay: Duration,
    pub dest_rate_delay: Duration,
    pub slot_cost: u32,
    pub slot_loan: u32,
    /// `100 - delivery_slot_discount`
    pub slot_loan_factor: u32,
    pub min_slots: u32,
    pub positive_feedback: Feedback,
    pub negative_feedback: Feedback,
    pub cohort_limit: u32,
}

impl TransportSettings {
    /// Resolve the settings of `name` from its overrides and the global values.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for a zero initial concurrency or a slot
    /// discount above 100.
    pub fn resolve(config: &QmgrConfig, name: &str) -> Result<Self, ConfigError> {
        let o = config.transports.get(name).cloned().unwrap_or_default();

        let dest_rate_delay =
            Duration::from_secs(o.dest_rate_delay_secs.unwrap_or(config.dest_rate_delay_secs));

        let mut dest_concurrency_limit = o
            .dest_concurrency_limit
            .unwrap_or(config.dest_concurrency_limit);
        if !dest_rate_delay.is_zero() {
            dest_concurrency_limit = 1;
        }

        let mut init_dest_concurrency = o
            .init_dest_concurrency
            .unwrap_or(config.init_dest_concurrency);
        if init_dest_concurrency == 0 {
            return Err(ConfigError::InitConcurrency {
                transport: name.to_string(),
            });
        }
        if dest_concurrency_limit > 0 {
            init_dest_concurrency = init_dest_concurrency.min(dest_concurrency_limit);
        }

        let discount = o
            .delivery_slot_discount
            .unwrap_or(config.delivery_slot_discount);
        if discount > 100 {
            return Err(ConfigError::SlotDiscount {
                transport: name.to_string(),
                value: discount,
            });
        }

        Ok(Self {
            dest_concurrency_limit,
            init_dest_concurrency,
            recipient_limit: o.recipient_limit.unwrap_or(config.recipient_limit),
            xport_rcpt_limit: o.xport_rcpt_limit.unwrap_or(config.xport_rcpt_limit),
            stack_rcpt_limit: o.stack_rcpt_limit.unwrap_or(config.stack_rcpt_limit),
            xport_refill_limit: o.xport_refill_limit.unwrap_or(config.xport_refill_limit),
            xport_refill_delay: Duration::from_secs(
                o.xport_refill_delay_secs
                    .unwrap_or(config.xport_refill_delay_secs),
            ),
            xport_rate_delay: Duration::from_secs(
                o.xport_rate_delay_secs.unwrap_or(config.xport_rate_delay_secs),
            ),
            dest_rate_delay,
            slot_cost: o.delivery_slot_cost.unwrap_or(config.delivery_slot_cost),
            slot_loan: o.delivery_slot_loan.unwrap_or(config.delivery_slot_loan),
            slot_loan_factor: 100 - discount,
            min_slots: o.min_delivery_slots.unwrap_or(config.min_delivery_slots),
            positive_feedback: o
                .conc_positive_feedback
                .unwrap_or(config.conc_positive_feedback),
            negative_feedback: o
                .conc_negative_feedback
                .unwrap_or(config.conc_negative_feedback),
            cohort_limit: o.conc_cohort_limit.unwrap_or(config.conc_cohort_limit),
        })
    }

    /// Preemption needs a slot cost of at least 2
    pub const fn preemption_enabled(&self) -> bool {
        self.slot_cost >= 2
    }

    /// Upper bound of a queue window, `None` when unlimited
    pub const fn window_limit(&self) -> Option<u32> {
        if self.dest_concurrency_limit == 0 {
            None
        } else {
            Some(self.dest_concurrency_limit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = QmgrConfig::default();
        let smtp = TransportSettings::resolve(&config, "smtp").unwrap();

        assert_eq!(smtp.dest_concurrency_limit, 20);
        assert_eq!(smtp.init_dest_concurrency, 5);
        assert_eq!(smtp.recipient_limit, 50);
        assert_eq!(smtp.slot_loan_factor, 50);
        assert!(smtp.preemption_enabled());
        assert_eq!(smtp.xport_rate_delay, Duration::ZERO);
        assert_eq!(config.transport_retry_time_secs, 60);
        assert_eq!(config.min_backoff_time_secs, 300);
    }

    #[test]
    fn log_section() {
        assert_eq!(QmgrConfig::default().log, LogConfig::default());

        let config: QmgrConfig =
            ron::from_str(r#"(log: (level: Some("debug"), ansi: false))"#).unwrap();
        assert_eq!(config.log.level.as_deref(), Some("debug"));
        assert!(!config.log.ansi);
    }

    #[test]
    fn rate_delay_forces_serial_delivery() {
        let config: QmgrConfig = ron::from_str(
            r#"(
                transports: {
                    "slow": (dest_rate_delay_secs: Some(2), dest_concurrency_limit: Some(8)),
                },
            )"#,
        )
        .unwrap();

        let slow = TransportSettings::resolve(&config, "slow").unwrap();
        assert_eq!(slow.dest_concurrency_limit, 1);
        assert_eq!(slow.init_dest_concurrency, 1);
        assert_eq!(slow.dest_rate_delay, Duration::from_secs(2));

        let other = TransportSettings::resolve(&config, "other").unwrap();
        assert_eq!(other.dest_concurrency_limit, 20);
    }

    #[test]
    fn init_is_clamped_to_limit() {
        let config = QmgrConfig {
            dest_concurrency_limit: 3,
            ..QmgrConfig::default()
        };
        let settings = TransportSettings::resolve(&config, "smtp").unwrap();
        assert_eq!(settings.init_dest_concurrency, 3);

        let unlimited = QmgrConfig {
            dest_concurrency_limit: 0,
            init_dest_concurrency: 7,
            ..QmgrConfig::default()
        };
        let settings = TransportSettings::resolve(&unlimited, "smtp").unwrap();
        assert_eq!(settings.init_dest_concurrency, 7);
        assert_eq!(settings.window_limit(), None);
    }

    #[test]
    fn feedback_from_config() {
        let config: QmgrConfig = ron::from_str(
            r#"(conc_positive_feedback: "1/concurrency", conc_negative_feedback: "1/sqrt_concurrency")"#,
        )
        .unwrap();
        assert_eq!(config.conc_positive_feedback, Feedback::PerWindow(1.0));
        assert_eq!(config.conc_negative_feedback, Feedback::PerSqrtWindow(1.0));

        assert!(ron::from_str::<QmgrConfig>(r#"(conc_positive_feedback: "lots")"#).is_err());
    }

    #[test]
    fn validation() {
        let mut config = QmgrConfig {
            delivery_slot_discount: 120,
            ..QmgrConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::SlotDiscount {
                transport: "default".to_string(),
                value: 120
            })
        );

        config.delivery_slot_discount = 50;
        config.transports.insert(
            "lmtp".to_string(),
            TransportOverrides {
                init_dest_concurrency: Some(0),
                ..TransportOverrides::default()
            },
        );
        assert_eq!(
            config.validate(),
            Err(ConfigError::InitConcurrency {
                transport: "lmtp".to_string()
            })
        );
    }

    #[test]
    fn deferred_transports() {
        let config = QmgrConfig {
            defer_transports: vec!["smtp".to_string()],
            ..QmgrConfig::default()
        };
        assert!(config.is_deferred_transport("smtp"));
        assert!(!config.is_deferred_transport("local"));
    }
}
