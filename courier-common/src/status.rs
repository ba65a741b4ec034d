use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DsnError {
    #[error("Malformed delivery status code: {0}")]
    MalformedStatus(String),

    #[error("Delivery status is missing a reason: {0}")]
    MissingReason(String),
}

/// A delivery status: an enhanced status code (`4.3.0`) and a human reason.
///
/// Every throttle and disposition event carries one of these. The pair is
/// also used verbatim to build the destination key of the error and retry
/// pseudo-transports, so two events with the same status and reason land on
/// the same queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDsn")]
pub struct Dsn {
    status: String,
    reason: String,
}

/// Wire form of a [`Dsn`], checked before it becomes one
#[derive(Deserialize)]
struct RawDsn {
    status: String,
    reason: String,
}

impl TryFrom<RawDsn> for Dsn {
    type Error = DsnError;

    fn try_from(raw: RawDsn) -> Result<Self, Self::Error> {
        if !is_valid_status(&raw.status) {
            return Err(DsnError::MalformedStatus(raw.status));
        }

        Ok(Self {
            status: raw.status,
            reason: raw.reason,
        })
    }
}

impl Dsn {
    /// Build a status from a code and reason.
    ///
    /// # Panics
    ///
    /// Panics if `status` is not a well formed `class.subject.detail` code.
    /// Status codes are produced internally; a malformed one is a bug.
    pub fn new(status: impl Into<String>, reason: impl Into<String>) -> Self {
        let status = status.into();
        assert!(
            is_valid_status(&status),
            "malformed delivery status code: {status}"
        );

        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The class digit: 2 (success), 4 (temporary) or 5 (permanent)
    pub fn class(&self) -> u8 {
        self.status.bytes().next().map_or(0, |b| b.wrapping_sub(b'0'))
    }

    pub fn is_temporary(&self) -> bool {
        self.class() == 4
    }

    pub fn is_permanent(&self) -> bool {
        self.class() == 5
    }

    /// The `"status reason"` key used to name pseudo-transport queues
    pub fn key(&self) -> String {
        format!("{} {}", self.status, self.reason)
    }
}

fn is_valid_status(status: &str) -> bool {
    let mut parts = status.split('.');
    let (Some(class), Some(subject), Some(detail), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    matches!(class, "2" | "4" | "5")
        && (1..=3).contains(&subject.len())
        && (1..=3).contains(&detail.len())
        && subject.bytes().chain(detail.bytes()).all(|b| b.is_ascii_digit())
}

impl FromStr for Dsn {
    type Err = DsnError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (status, reason) = value
            .trim()
            .split_once(' ')
            .ok_or_else(|| DsnError::MissingReason(value.to_string()))?;

        if !is_valid_status(status) {
            return Err(DsnError::MalformedStatus(status.to_string()));
        }

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(DsnError::MissingReason(value.to_string()));
        }

        Ok(Self {
            status: status.to_string(),
            reason: reason.to_string(),
        })
    }
}

impl Display for Dsn {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{} {}", self.status, self.reason)
    }
}
