//! Error handling
//!
//! A single flat enumeration is used across the whole workspace.
//! Propagation is strictly by return value; the UEFI application converts
//! to a `Status` at its outermost boundary.

/// Everything that can go wrong, in one flat list.
///
/// The C ancestry of this loader used negative values of the same codes
/// for warnings; here a warning is an [`Error`] with the `warning` flag
/// set instead.
#[derive(displaydoc::Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// invalid parameter
    InvalidParameter,
    /// not found
    NotFound,
    /// out of resources
    OutOfResources,
    /// unsupported
    Unsupported,
    /// bad type
    BadType,
    /// bad architecture
    BadArch,
    /// bad header
    BadHeader,
    /// unexpected end of file
    UnexpectedEof,
    /// not an executable
    NotExecutable,
    /// volume corrupted
    VolumeCorrupted,
    /// incompatible version
    IncompatibleVersion,
    /// timed out
    Timeout,
    /// aborted
    Aborted,
    /// syntax error
    Syntax,
    /// insecure
    Insecure,
    /// security violation
    SecurityViolation,
    /// buffer too small
    BufferTooSmall,
    /// inconsistent data
    InconsistentData,
}

/// An error (or a warning) of some [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    /// Warnings report the same conditions but leave the caller free to
    /// carry on (the sign bit of the original error codes).
    pub warning: bool,
}

impl Error {
    /// A hard error of the given kind.
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, warning: false }
    }

    /// A warning of the given kind.
    pub const fn warning(kind: ErrorKind) -> Self {
        Self { kind, warning: true }
    }

    pub const fn is_warning(&self) -> bool {
        self.warning
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.warning {
            write!(f, "warning: {}", self.kind)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
