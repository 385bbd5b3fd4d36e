use thiserror::Error;

/// Shared error domain for the coordinator and node agent. Crate-specific
/// errors (crypto, runtime, session) convert into this one at the
/// service boundary rather than being re-derived per caller.
#[derive(Debug, Error)]
pub enum V6Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl V6Error {
    pub fn status_code(&self) -> u16 {
        match self {
            V6Error::NotFound(_) => 404,
            V6Error::InvalidRequest(_) => 400,
            V6Error::Unauthorized(_) => 401,
            V6Error::Conflict(_) => 409,
            V6Error::Internal(_) => 500,
        }
    }
}
