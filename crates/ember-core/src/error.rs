//! # EMBER Error Handling
//!
//! One error type for the whole scheduler stack.
//!
//! Error handling in EMBER follows these principles:
//! - Every fallible operation returns [`Result`]
//! - Errors are `Copy` and carry a static reason, never an allocation
//! - Expected conditions (partition exhaustion, size queries, timeouts) are
//!   distinguishable from faults so callers can retry without logging
//! - A fault is attributed to one context and never escalates past it

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// EMBER Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// EMBER unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Unknown or already-destroyed handle
    InvalidHandle,
    /// Malformed size, type or field, or a non-zero reserved field
    InvalidArgument(&'static str),
    /// Operation not permitted in the current lifecycle state
    InvalidState(&'static str),
    /// A bounded resource ran out
    ResourceExhausted(Resource),
    /// A wait exceeded its deadline
    Timeout,
    /// Firmware or device reported an execution error
    HardwareFault(FaultCode),
    /// Output buffer cannot hold the reply; nothing was written
    BufferTooSmall {
        /// Bytes (or elements, for array queries) the reply needs
        needed: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::InvalidArgument(why) => write!(f, "invalid argument: {why}"),
            Self::InvalidState(why) => write!(f, "invalid state: {why}"),
            Self::ResourceExhausted(res) => write!(f, "resource exhausted: {res}"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::HardwareFault(code) => write!(f, "hardware fault: {code}"),
            Self::BufferTooSmall { needed } => {
                write!(f, "buffer too small: {needed} needed")
            },
        }
    }
}

// =============================================================================
// ERROR KIND
// =============================================================================

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::InvalidHandle`]
    InvalidHandle,
    /// See [`Error::InvalidArgument`] and [`Error::BufferTooSmall`]
    InvalidArgument,
    /// See [`Error::InvalidState`]
    InvalidState,
    /// See [`Error::ResourceExhausted`]
    ResourceExhausted,
    /// See [`Error::Timeout`]
    Timeout,
    /// See [`Error::HardwareFault`]
    HardwareFault,
}

impl Error {
    /// Classify this error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidHandle => ErrorKind::InvalidHandle,
            Self::InvalidArgument(_) | Self::BufferTooSmall { .. } => ErrorKind::InvalidArgument,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Timeout => ErrorKind::Timeout,
            Self::HardwareFault(_) => ErrorKind::HardwareFault,
        }
    }

    /// Negative errno the ioctl layer reports for this error
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidHandle => -2,          // ENOENT
            Self::InvalidArgument(_) => -22,    // EINVAL
            Self::BufferTooSmall { .. } => -22, // EINVAL, size written back
            Self::InvalidState(_) => -16,       // EBUSY
            Self::ResourceExhausted(Resource::Memory) => -12, // ENOMEM
            Self::ResourceExhausted(_) => -28,  // ENOSPC
            Self::Timeout => -62,               // ETIME
            Self::HardwareFault(_) => -5,       // EIO
        }
    }

    /// Expected condition the caller may simply retry or query again
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::BufferTooSmall { .. }
                | Self::ResourceExhausted(Resource::Columns)
                | Self::ResourceExhausted(Resource::QueueDepth)
        )
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Bounded resources that can run out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// No free AIE column range of the requested width
    Columns,
    /// Handle table is full
    Handles,
    /// Per-context queue depth limit
    QueueDepth,
    /// Heap or device address space is full
    Memory,
    /// Array query element cap
    Elements,
    /// Firmware context slots
    FirmwareContexts,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Columns => "AIE columns",
            Self::Handles => "handle slots",
            Self::QueueDepth => "queue depth",
            Self::Memory => "device memory",
            Self::Elements => "array elements",
            Self::FirmwareContexts => "firmware contexts",
        };
        f.write_str(name)
    }
}

/// Device-reported fault codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// Command aborted by firmware
    CommandAborted,
    /// Command exceeded its operation timeout on the device
    CommandTimeout,
    /// AIE tile raised an exception
    TileException,
    /// Firmware rejected a request
    FirmwareRejected,
    /// Vendor-specific status word
    Status(u32),
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandAborted => write!(f, "command aborted"),
            Self::CommandTimeout => write!(f, "command timed out on device"),
            Self::TileException => write!(f, "AIE tile exception"),
            Self::FirmwareRejected => write!(f, "firmware rejected request"),
            Self::Status(code) => write!(f, "status 0x{code:08x}"),
        }
    }
}

impl From<FaultCode> for Error {
    fn from(code: FaultCode) -> Self {
        Error::HardwareFault(code)
    }
}

impl From<Resource> for Error {
    fn from(res: Resource) -> Self {
        Error::ResourceExhausted(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_too_small_is_invalid_argument_kind() {
        let err = Error::BufferTooSmall { needed: 64 };
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.errno(), -22);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_faults_are_not_retryable() {
        let err: Error = FaultCode::TileException.into();
        assert_eq!(err.kind(), ErrorKind::HardwareFault);
        assert!(!err.is_retryable());
        assert!(!Error::InvalidHandle.is_retryable());
    }

    #[test]
    fn test_column_exhaustion_is_retryable() {
        let err: Error = Resource::Columns.into();
        assert!(err.is_retryable());
        assert!(!Error::ResourceExhausted(Resource::Handles).is_retryable());
    }
}
