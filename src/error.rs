//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`. Each concern keeps
//! its own `thiserror` enum next to the code that raises it and `DaqError`
//! consolidates them, so the `?` operator works across layers:
//!
//! - **`Config`**: wraps `figment` errors, i.e. unreadable files, syntax errors
//!   and missing keys.
//! - **`Configuration`**: semantic errors found while validating a loaded
//!   configuration (mismatched list lengths, unknown transforms, a layout that
//!   does not cover the register block).
//! - **`Transport`**: the register read failed. Fatal to the poll loop that
//!   issued the read.
//! - **`Decode`**: the register block does not match the declared layout.
//!   Fatal to the poll loop, since continuing would misinterpret data.
//! - **`Sink`**: a point could not be written. Poll loops log these and carry
//!   on; the variant exists for callers that write outside a loop.
//! - **`AllGroupsFailed`**: every poll loop has died, nothing is left to run.
//!
//! Unknown enumeration codes are deliberately absent: they are recovered from
//! inside the point assembler and never propagate.

use crate::decoder::DecodeError;
use crate::sink::SinkError;
use crate::transport::TransportError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("All {0} measurement groups stopped with errors")]
    AllGroupsFailed(usize),
}

impl DaqError {
    /// Whether the error ends the poll loop that raised it.
    pub fn is_fatal_to_loop(&self) -> bool {
        !matches!(self, DaqError::Sink(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transport_errors_are_fatal_to_loops() {
        let err: DaqError = TransportError::Timeout {
            start: 1000,
            count: 10,
            timeout: Duration::from_secs(5),
        }
        .into();
        assert!(err.is_fatal_to_loop());
        assert!(err.to_string().starts_with("Transport error"));
    }

    #[test]
    fn sink_errors_are_not_fatal() {
        let err: DaqError = SinkError::Rejected {
            status: 401,
            body: "unauthorized".into(),
        }
        .into();
        assert!(!err.is_fatal_to_loop());
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn decode_errors_keep_their_message() {
        let err: DaqError = DecodeError::LengthMismatch {
            layout: ">hh".into(),
            layout_bytes: 4,
            received_bytes: 6,
        }
        .into();
        assert!(err.is_fatal_to_loop());
        assert!(err.to_string().contains("spans 4 bytes"));
    }
}
