use thiserror::Error;

use crate::auth::AuthError;
use crate::conclave::frame::FrameError;
use crate::conclave::session::SessionError;
use crate::conclave::wire::WireError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Frame(e) => e.transience(),
            Error::Wire(e) => e.transience(),
            Error::Session(e) => e.transience(),
            Error::Auth(e) => e.transience(),
        }
    }
}
