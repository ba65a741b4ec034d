use std::path::{Component, Path, PathBuf};

use courier_common::internal;
use serde::Deserialize;

use crate::error::{Result, SpoolError, ValidationError};

/// Names of the queue directories under the spool root
pub mod queues {
    pub const MAILDROP: &str = "maildrop";
    pub const INCOMING: &str = "incoming";
    pub const ACTIVE: &str = "active";
    pub const DEFERRED: &str = "deferred";
    pub const HOLD: &str = "hold";
    pub const CORRUPT: &str = "corrupt";

    /// Per-message disposition logs
    pub const BOUNCE: &str = "bounce";
    pub const DEFER: &str = "defer";

    pub const ALL: [&str; 8] = [MAILDROP, INCOMING, ACTIVE, DEFERRED, HOLD, CORRUPT, BOUNCE, DEFER];
}

fn default_path() -> PathBuf {
    PathBuf::from("/var/spool/courier")
}

const SENSITIVE_PREFIXES: [&str; 9] = [
    "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
];

/// Location of the spool
///
/// ```ron
/// spool: (
///     path: "/var/spool/courier",
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SpoolConfig {
    #[serde(default = "default_path")]
    path: PathBuf,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
        }
    }
}

impl SpoolConfig {
    /// Create a configuration rooted at `path`
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the path is relative, contains `..`
    /// or points into a system directory.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        Self::validate_path(&path)?;
        Ok(Self { path })
    }

    fn validate_path(path: &Path) -> std::result::Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentComponent(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        if let Some(prefix) = SENSITIVE_PREFIXES
            .into_iter()
            .find(|prefix| path.starts_with(prefix))
        {
            return Err(ValidationError::SystemDirectory {
                prefix,
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory of the named queue
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::UnknownQueue`] for a name that is not in [`queues::ALL`].
    pub fn queue_path(&self, queue: &str) -> Result<PathBuf> {
        if queues::ALL.contains(&queue) {
            Ok(self.path.join(queue))
        } else {
            Err(SpoolError::UnknownQueue(queue.to_string()))
        }
    }

    /// Validate the root and create every queue directory
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails, the root exists but is not a
    /// directory, or a queue directory cannot be created.
    pub fn init(&self) -> Result<()> {
        Self::validate_path(&self.path)?;

        if self.path.exists() && !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        for queue in queues::ALL {
            std::fs::create_dir_all(self.path.join(queue))?;
        }

        internal!(level = INFO, "Spool initialised at {}", self.path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_dir() {
        let err = SpoolConfig::new("/var/spool/../etc/passwd").unwrap_err();
        assert!(err.to_string().contains("cannot contain '..'"));
    }

    #[test]
    fn rejects_relative() {
        let err = SpoolConfig::new("relative/path").unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn rejects_system_directories() {
        for path in ["/etc/spool", "/proc/mail", "/usr/sbin/q"] {
            let err = SpoolConfig::new(path).unwrap_err();
            assert!(
                err.to_string().contains("system directory"),
                "Wrong error for path {path}"
            );
        }
    }

    #[test]
    fn queue_paths() {
        let config = SpoolConfig::new("/var/spool/courier").unwrap();
        assert_eq!(
            config.queue_path(queues::DEFERRED).unwrap(),
            PathBuf::from("/var/spool/courier/deferred")
        );
        assert!(matches!(
            config.queue_path("elsewhere"),
            Err(SpoolError::UnknownQueue(_))
        ));
    }

    #[test]
    fn deserialize_with_default() {
        let config: SpoolConfig = ron::from_str("()").unwrap();
        assert_eq!(config.path(), Path::new("/var/spool/courier"));
    }
}
