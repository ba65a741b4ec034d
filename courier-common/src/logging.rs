use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

/// Lifecycle messages of the queue manager itself (start, stop, scans)
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

/// Scheduling decisions: transport and queue state changes
#[macro_export]
macro_rules! scheduler {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "scheduler", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::scheduler!(level = DEBUG, $($msg),*)
    };
}

/// Where queue manager diagnostics go and how verbose they are
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Maximum level shown, overridden by `LOG_LEVEL`. Unset means TRACE
    /// for debug builds and INFO for release builds.
    #[serde(default)]
    pub level: Option<String>,

    #[serde(default = "LogConfig::default_ansi")]
    pub ansi: bool,
}

impl LogConfig {
    const fn default_ansi() -> bool {
        true
    }

    fn level(&self, env: Option<&str>) -> LevelFilter {
        let default = if cfg!(debug_assertions) {
            LevelFilter::TRACE
        } else {
            LevelFilter::INFO
        };

        env.or(self.level.as_deref()).map_or(default, |level| {
            LevelFilter::from_str(level).unwrap_or_else(|_| {
                eprintln!("Invalid log level specified {level}, defaulting to {default}");
                default
            })
        })
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            ansi: Self::default_ansi(),
        }
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber is already installed, which leaves
/// the existing one in place.
pub fn init(config: &LogConfig) -> bool {
    let level = config.level(std::env::var("LOG_LEVEL").ok().as_deref());

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(config.ansi)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("courier")
                })),
        )
        .try_init()
        .is_ok()
}
