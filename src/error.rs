//! Error taxonomy for AI-dependent operations.
//!
//! `Transport`, `Timeout`, and `Backend` are caught at the degradation
//! boundary and converted into degraded results. `Parse` is recovered
//! locally by the stream decoder. `InvalidArgument` is the only class
//! surfaced to callers, since it indicates a caller bug.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Network failure reaching the AI backend.
    #[error("transport error: {0}")]
    Transport(String),

    /// A backend call exceeded its deadline. Treated identically to a
    /// transport failure.
    #[error("request timed out")]
    Timeout,

    /// Bad caller input (unknown search mode, empty message history, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed stream frame. Logged and dropped, never fatal.
    #[error("malformed frame: {0}")]
    Parse(String),

    /// Well-formed error payload from the AI backend.
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Whether this error should be absorbed into a degraded result
    /// instead of propagating to the caller.
    pub fn is_degradable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout | Error::Backend(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Check whether an `anyhow` chain bottoms out in a degradable [`Error`].
pub fn is_degradable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Error>().is_some_and(Error::is_degradable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degradable_classes() {
        assert!(Error::Transport("refused".into()).is_degradable());
        assert!(Error::Timeout.is_degradable());
        assert!(Error::Backend("overloaded".into()).is_degradable());
        assert!(!Error::InvalidArgument("bad mode".into()).is_degradable());
        assert!(!Error::Parse("truncated".into()).is_degradable());
    }

    #[test]
    fn test_anyhow_downcast() {
        let err: anyhow::Error = Error::Timeout.into();
        assert!(is_degradable(&err));

        let err = anyhow::anyhow!("unrelated");
        assert!(!is_degradable(&err));
    }
}
