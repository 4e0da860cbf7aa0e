use thiserror::Error;

/// Mapped to 4xx responses at the HTTP layer; never retried.
#[derive(Debug, Error, PartialEq)]
pub enum DomainError {
    #[error("time {time}ms is outside timeline 0..{period}ms")]
    OutOfRange { time: u64, period: u64 },

    #[error("the point at 00:00 cannot be removed or moved")]
    ProtectedPoint,

    #[error("no point at index {0}")]
    NoSuchPoint(usize),

    #[error("bad timeline bounds: min {min} > max {max}")]
    BadBounds { min: f64, max: f64 },

    #[error("timeline period must be > 0")]
    BadPeriod,

    #[error("bad request field {field}: {detail}")]
    BadRequest {
        field: &'static str,
        detail: String,
    },

    #[error("{0} is not a known service")]
    UnknownService(String),
}

impl DomainError {
    pub fn bad_request(field: &'static str, detail: impl Into<String>) -> Self {
        Self::BadRequest {
            field,
            detail: detail.into(),
        }
    }
}
