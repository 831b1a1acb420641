/// Collie error types.
///
/// Errors cross the public API boundary as small negative integers in the
/// platform errno convention, so every variant round-trips through an
/// errno code. The severity ranking drives the worst-error-wins
/// accumulation in the completion aggregate.
use serde::{Deserialize, Serialize};

/// Unified error type for all collie operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum VolError {
    #[error("invalid parameters")]
    InvalidParam,
    #[error("volume is read-only")]
    ReadOnly,
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("I/O error")]
    Io,
    #[error("no such object")]
    NoObject,
    #[error("object exists already")]
    ObjectExists,
    #[error("journal is shutting down")]
    ShuttingDown,
    #[error("no space available")]
    NoSpace,
    #[error("corrupt journal entry")]
    CorruptEntry,
}

impl VolError {
    /// Convert to the errno-convention return code (a small negative int).
    pub fn to_errno(self) -> i32 {
        match self {
            Self::InvalidParam => -22,     // -EINVAL
            Self::ReadOnly => -30,         // -EROFS
            Self::PermissionDenied => -1,  // -EPERM
            Self::Io => -5,                // -EIO
            Self::NoObject => -2,          // -ENOENT
            Self::ObjectExists => -17,     // -EEXIST
            Self::ShuttingDown => -108,    // -ESHUTDOWN
            Self::NoSpace => -28,          // -ENOSPC
            Self::CorruptEntry => -74,     // -EBADMSG
        }
    }

    /// Convert an errno-convention return code back to a VolError.
    ///
    /// Codes without a dedicated variant collapse to `Io`.
    pub fn from_errno(code: i32) -> Option<Self> {
        match code {
            0 => None,
            -22 => Some(Self::InvalidParam),
            -30 => Some(Self::ReadOnly),
            -1 => Some(Self::PermissionDenied),
            -5 => Some(Self::Io),
            -2 => Some(Self::NoObject),
            -17 => Some(Self::ObjectExists),
            -108 => Some(Self::ShuttingDown),
            -28 => Some(Self::NoSpace),
            -74 => Some(Self::CorruptEntry),
            _ => Some(Self::Io),
        }
    }

    /// Severity rank for worst-error-wins accumulation.
    ///
    /// Permission failures outrank I/O failures, which outrank a missing
    /// object. Higher is worse.
    pub fn severity(self) -> u8 {
        match self {
            Self::PermissionDenied | Self::ReadOnly => 4,
            Self::ShuttingDown => 3,
            Self::Io | Self::NoSpace | Self::CorruptEntry | Self::InvalidParam => 2,
            Self::ObjectExists => 2,
            Self::NoObject => 1,
        }
    }

    /// Pick the more severe of two errno codes (ties keep `a`, the first
    /// recorded error).
    pub fn worse_errno(a: i32, b: i32) -> i32 {
        debug_assert!(a < 0 && b < 0);
        let sa = Self::from_errno(a).map_or(0, Self::severity);
        let sb = Self::from_errno(b).map_or(0, Self::severity);
        if sb > sa {
            b
        } else {
            a
        }
    }
}

/// Result type alias for collie operations.
pub type VolResult<T> = Result<T, VolError>;

impl From<std::io::Error> for VolError {
    fn from(_: std::io::Error) -> Self {
        VolError::Io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_round_trip() {
        for e in [
            VolError::InvalidParam,
            VolError::ReadOnly,
            VolError::PermissionDenied,
            VolError::Io,
            VolError::NoObject,
            VolError::ObjectExists,
            VolError::ShuttingDown,
            VolError::NoSpace,
            VolError::CorruptEntry,
        ] {
            assert_eq!(VolError::from_errno(e.to_errno()), Some(e));
        }
        assert_eq!(VolError::from_errno(0), None);
    }

    #[test]
    fn test_unknown_errno_is_io() {
        assert_eq!(VolError::from_errno(-71), Some(VolError::Io));
    }

    #[test]
    fn test_severity_precedence() {
        // permission > I/O > not-found
        assert_eq!(VolError::worse_errno(-2, -5), -5);
        assert_eq!(VolError::worse_errno(-5, -1), -1);
        assert_eq!(VolError::worse_errno(-1, -2), -1);
        // first error of equal severity sticks
        assert_eq!(VolError::worse_errno(-5, -28), -5);
    }
}
