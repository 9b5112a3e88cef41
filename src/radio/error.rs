use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ControllerError {
    #[error("cannot connect to {address}: {message}")]
    Connect { address: String, message: String },
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("`{command}` rejected with RPRT {code}")]
    Rejected { command: String, code: i32 },
    #[error("malformed reply to `{command}`: {reply:?}")]
    Protocol { command: String, reply: String },
}

impl ControllerError {
    /// Errors after which the connection can no longer be trusted.
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self,
            ControllerError::Connect { .. }
                | ControllerError::Timeout { .. }
                | ControllerError::ConnectionLost(_)
        )
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(err: std::io::Error) -> Self {
        ControllerError::ConnectionLost(err.to_string())
    }
}
