use std::{fmt, str::FromStr};

use serde::Deserialize;

use crate::error::ConfigError;

/// Amount of concurrency feedback applied per delivery outcome.
///
/// Written as `"<n>"`, `"<n>/<d>"`, `"<n>/concurrency"` or
/// `"<n>/sqrt_concurrency"`; the last two scale inversely with the current
/// window, so a wide window needs proportionally more outcomes to move.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub enum Feedback {
    Constant(f64),
    PerWindow(f64),
    PerSqrtWindow(f64),
}

impl Feedback {
    /// Feedback for one outcome at the given window
    pub fn value(self, window: u32) -> f64 {
        let window = f64::from(window.max(1));
        match self {
            Self::Constant(base) => base,
            Self::PerWindow(base) => base / window,
            Self::PerSqrtWindow(base) => base / window.sqrt(),
        }
    }
}

impl Default for Feedback {
    fn default() -> Self {
        Self::Constant(1.0)
    }
}

fn number(value: &str, raw: &str) -> Result<f64, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite() && *n > 0.0)
        .ok_or_else(|| ConfigError::Feedback(raw.to_string()))
}

impl FromStr for Feedback {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (numerator, denominator) = match raw.split_once('/') {
            Some((n, d)) => (n, Some(d.trim())),
            None => (raw, None),
        };
        let base = number(numerator, raw)?;

        let feedback = match denominator {
            None => Self::Constant(base),
            Some("concurrency") => Self::PerWindow(base),
            Some("sqrt_concurrency") => Self::PerSqrtWindow(base),
            Some(divisor) => Self::Constant(base / number(divisor, raw)?),
        };

        match feedback {
            Self::Constant(value) if value > 1.0 => Err(ConfigError::Feedback(raw.to_string())),
            _ => Ok(feedback),
        }
    }
}

impl TryFrom<String> for Feedback {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(base) => write!(f, "{base}"),
            Self::PerWindow(base) => write!(f, "{base}/concurrency"),
            Self::PerSqrtWindow(base) => write!(f, "{base}/sqrt_concurrency"),
        }
    }
}
