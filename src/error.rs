use thiserror::Error;

/// Errors raised by the ring buffer, the codec session and the framing layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The codec rejected the stream parameters. `code` is the codec's
    /// own non-zero status.
    #[error("codec rejected configuration (code {code}): {reason}")]
    Config { code: i32, reason: String },

    /// A resize was asked to go below the current occupancy.
    #[error("cannot resize to {requested} bytes while {stored} bytes are stored")]
    Capacity { requested: usize, stored: usize },

    /// The buffer is already at its maximum size and still needs more room.
    #[error("ring buffer already at maximum capacity ({capacity} bytes)")]
    AtMaximum { capacity: usize },

    /// Header or payload requested before `initialize` succeeded.
    #[error("codec session is not initialised")]
    NotInitialized,

    /// The page writer failed while framing packets.
    #[error("framing packets into pages")]
    Framing(#[from] std::io::Error),
}

impl Error {
    /// Codec status code for configuration failures, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Config { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_exposes_code() {
        let err = Error::Config {
            code: -131,
            reason: "bad quality".into(),
        };
        assert_eq!(err.code(), Some(-131));
        assert!(err.to_string().contains("-131"));
    }

    #[test]
    fn test_capacity_error_has_no_code() {
        let err = Error::Capacity {
            requested: 4,
            stored: 9,
        };
        assert_eq!(err.code(), None);
        assert_eq!(
            err.to_string(),
            "cannot resize to 4 bytes while 9 bytes are stored"
        );
    }
}
