pub mod logging;
pub mod status;

pub use logging::LogConfig;
pub use status::{Dsn, DsnError};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
