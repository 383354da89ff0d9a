//! Error types for the monitor core.

use thiserror::Error;

/// Errors surfaced by monitor core operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// A sync chunk failed its integrity check.
    #[error("sync chunk CRC mismatch: expected {expected:#010x}, got {got:#010x}")]
    CrcMismatch {
        /// CRC the provider claimed.
        expected: u32,
        /// CRC recomputed locally.
        got: u32,
    },

    /// This monitor was removed from the peer map after having joined.
    #[error("removed from the peer map after joining; terminating")]
    Fenced,
}

/// Negative codes carried in command acknowledgements.
///
/// Mirrors the errno-style convention clients already understand.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// Capability check failed.
    #[error("access denied")]
    AccessDenied,
    /// Operation not permitted (e.g. wrong cluster fsid).
    #[error("operation not permitted")]
    NotPermitted,
    /// Command was not recognized or malformed.
    #[error("invalid command")]
    Invalid,
}

impl CommandError {
    /// The numeric code placed in a `MonCommandAck`.
    pub fn code(self) -> i32 {
        match self {
            CommandError::AccessDenied => -13,
            CommandError::NotPermitted => -1,
            CommandError::Invalid => -22,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_mismatch_display_includes_both_values() {
        let err = MonitorError::CrcMismatch {
            expected: 0xdead_beef,
            got: 0x1234_5678,
        };
        let text = err.to_string();
        assert!(text.contains("0xdeadbeef"));
        assert!(text.contains("0x12345678"));
    }

    #[test]
    fn command_error_codes_are_negative() {
        for err in [
            CommandError::AccessDenied,
            CommandError::NotPermitted,
            CommandError::Invalid,
        ] {
            assert!(err.code() < 0);
        }
    }

    #[test]
    fn access_denied_code_matches_convention() {
        assert_eq!(CommandError::AccessDenied.code(), -13);
        assert_eq!(CommandError::Invalid.code(), -22);
    }
}
