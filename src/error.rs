use std::io;
use std::time::Duration;

use thiserror::Error;

/// Classification of a failed connection attempt, reported through
///  [crate::callbacks::ConnectCallback::connect_failed] once the retry budget is exhausted
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not resolve host {host:?}: {source}")]
    HostResolution { host: String, #[source] source: io::Error },
    #[error("connection refused by {target}: {source}")]
    Refused { target: String, #[source] source: io::Error },
    #[error("connecting to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("connecting to {target} failed: {source}")]
    Other { target: String, #[source] source: io::Error },
}

impl ConnectError {
    /// classifies an error returned by the connect call itself (i.e. after successful resolution)
    pub fn classify(target: &str, source: io::Error) -> ConnectError {
        let target = target.to_string();
        match source.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused { target, source },
            io::ErrorKind::TimedOut => ConnectError::Timeout { target, timeout: Duration::ZERO },
            _ => ConnectError::Other { target, source },
        }
    }

    pub fn kind(&self) -> ConnectErrorKind {
        match self {
            ConnectError::HostResolution { .. } => ConnectErrorKind::HostResolution,
            ConnectError::Refused { .. } => ConnectErrorKind::Refused,
            ConnectError::Timeout { .. } => ConnectErrorKind::Timeout,
            ConnectError::Other { .. } => ConnectErrorKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectErrorKind {
    HostResolution,
    Refused,
    Timeout,
    Other,
}


#[derive(Debug, Error)]
pub enum ListenError {
    #[error("could not listen on port {port}: {source}")]
    Bind { port: u16, #[source] source: io::Error },
}


#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("socket error while receiving: {0}")]
    Socket(#[from] io::Error),
    #[error("could not decode received message: {0}")]
    ProtocolDecode(String),
    #[error("error while receiving: {0}")]
    Other(anyhow::Error),
}

impl ReceiveError {
    /// `true` if the peer closed the connection in an orderly fashion
    pub fn is_eof(&self) -> bool {
        matches!(self, ReceiveError::Socket(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}


#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("socket error while transmitting: {0}")]
    Socket(#[from] io::Error),
    #[error("error while transmitting: {0}")]
    Other(anyhow::Error),
}
