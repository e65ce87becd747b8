use thiserror::Error;

/// Failures of the price-to-plan computation. Not recoverable for the day
/// they were raised on; the control loop retries on the next tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("insufficient price data: {0}")]
    InsufficientData(String),

    #[error("invalid policy for circuit {circuit_id}: {reason}")]
    InvalidPolicy { circuit_id: String, reason: String },
}

/// Transport-level failures of a single serial link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("failed to open serial port {path}: {reason}")]
    Connection { path: String, reason: String },

    #[error("serial link is down")]
    LinkDown,

    #[error("timed out waiting for the board")]
    Timeout,

    #[error("malformed frame: {0}")]
    Parse(String),

    #[error("failed to write frame: {0}")]
    Send(String),
}

impl LinkError {
    /// Whether the error means the board cannot be reached at all, as opposed
    /// to a single exchange going wrong on a live link.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, LinkError::LinkDown | LinkError::Connection { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("relay for circuit {0} is unreachable")]
    Unreachable(String),

    #[error("unknown circuit: {0}")]
    UnknownCircuit(String),

    #[error("circuit {circuit_id} acknowledged {acked_on} but {desired_on} was requested")]
    Mismatch {
        circuit_id: String,
        desired_on: bool,
        acked_on: bool,
    },

    #[error(transparent)]
    Link(#[from] LinkError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_classification() {
        assert!(LinkError::LinkDown.is_unreachable());
        assert!(LinkError::Connection {
            path: "/dev/ttyACM0".into(),
            reason: "no such file".into()
        }
        .is_unreachable());
        assert!(!LinkError::Timeout.is_unreachable());
        assert!(!LinkError::Parse("bad checksum".into()).is_unreachable());
    }

    #[test]
    fn link_error_converts_into_relay_error() {
        let err: RelayError = LinkError::Timeout.into();
        assert_eq!(err, RelayError::Link(LinkError::Timeout));
        assert_eq!(err.to_string(), "timed out waiting for the board");
    }
}
