use std::{fmt, io, path::PathBuf};

use tokio::{net::UnixStream, sync::mpsc};
use tracing::debug;

/// Identifies one connection request from `alloc` to its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocId(pub(crate) u64);

impl fmt::Display for AllocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc#{}", self.0)
    }
}

/// Completion of a connection request
pub type ConnectEvent<S> = (AllocId, io::Result<S>);

/// Opens non-blocking connections to delivery agents.
///
/// `connect` only starts the attempt. The outcome arrives later as a
/// [`ConnectEvent`], which the owner feeds to
/// [`Scheduler::connect_complete`](crate::Scheduler::connect_complete).
pub trait Connector: Send {
    /// Start connecting to the agent behind `service`
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint is known to be unreachable without
    /// waiting, e.g. the listening socket does not exist.
    fn connect(&mut self, service: &str, alloc: AllocId) -> io::Result<()>;
}

/// Connects to agents listening on `<dir>/<service>` unix sockets
pub struct UnixConnector {
    dir: PathBuf,
    events: mpsc::UnboundedSender<ConnectEvent<UnixStream>>,
}

impl UnixConnector {
    pub fn new(
        dir: impl Into<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectEvent<UnixStream>>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                dir: dir.into(),
                events,
            },
            receiver,
        )
    }
}

impl Connector for UnixConnector {
    fn connect(&mut self, service: &str, alloc: AllocId) -> io::Result<()> {
        let path = self.dir.join(service);
        if !path.try_exists()? {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no listener at {}", path.display()),
            ));
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            let result = UnixStream::connect(&path).await;
            if events.send((alloc, result)).is_err() {
                debug!(%alloc, "connection completed after the scheduler went away");
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_socket_fails_synchronously() {
        let temp = tempfile::tempdir().unwrap();
        let (mut connector, _events) = UnixConnector::new(temp.path());

        let err = connector.connect("smtp", AllocId(1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn completion_arrives_as_event() {
        let temp = tempfile::tempdir().unwrap();
        let _listener = tokio::net::UnixListener::bind(temp.path().join("local")).unwrap();
        let (mut connector, mut events) = UnixConnector::new(temp.path());

        connector.connect("local", AllocId(7)).unwrap();

        let (alloc, result) = events.recv().await.unwrap();
        assert_eq!(alloc, AllocId(7));
        assert!(result.is_ok());
    }
}
