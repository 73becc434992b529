// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
// 4. A coarse, matchable error kind so callers at an API boundary can distinguish
//    INVAL from PROTO from NOT_FOUND etc. without downcasting.

use std::borrow::Cow;
use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// Error kinds produced at the core's API boundary. See spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed argument at an API boundary.
    Inval,
    /// Malformed frame, ill-typed field, or route op without routing enabled.
    Proto,
    /// Authorization denied.
    Perm,
    /// Buffer capacity exceeded.
    NoSpace,
    /// Write attempted on a read-only buffer.
    ReadOnly,
    /// Duplicate fence name, or duplicate callback registration of a different variant.
    Exists,
    /// Missing cache entry, missing hostname.
    NotFound,
    /// Bootstrap connect deadline exceeded.
    TimedOut,
    /// Key-path conflict: expected non-directory, found directory.
    IsDir,
    /// Key-path conflict: expected non-symlink, found symlink.
    IsSymlink,
    /// Operation not supported (e.g. append onto a symlink).
    Unsupported,
    /// Invariant violation (hash mismatch, internal state corruption). The
    /// owning object is poisoned after surfacing this once.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Inval => "INVAL",
            ErrorKind::Proto => "PROTO",
            ErrorKind::Perm => "PERM",
            ErrorKind::NoSpace => "NOSPACE",
            ErrorKind::ReadOnly => "READONLY",
            ErrorKind::Exists => "EXISTS",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::TimedOut => "TIMEDOUT",
            ErrorKind::IsDir => "IS_DIR",
            ErrorKind::IsSymlink => "IS_SYMLINK",
            ErrorKind::Unsupported => "UNSUPPORTED",
            ErrorKind::Fatal => "FATAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    #[allow(dead_code)]
    inner: DynBacktraceError,
}
pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

// Foreign errors (io, parse, etc.) arrive with no natural ErrorKind of their
// own; they're treated as FATAL since they indicate something the core's
// contracts didn't anticipate.
impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(ErrorKind::Fatal, err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(kind: ErrorKind, err: E) -> Error {
        error!(target: "weft", kind = kind.as_str(), "{:?}", err);
        let inner = DynBacktraceError::from(err);
        Error { kind, inner }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.kind, self.inner)
    }
}

pub fn err(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    let e = SimpleErr(msg.into());
    Error::new(kind, e)
}

pub fn invalid(msg: impl Into<Cow<'static, str>>) -> Error {
    err(ErrorKind::Inval, msg)
}

pub fn proto(msg: impl Into<Cow<'static, str>>) -> Error {
    err(ErrorKind::Proto, msg)
}

pub fn not_found(msg: impl Into<Cow<'static, str>>) -> Error {
    err(ErrorKind::NotFound, msg)
}

pub fn fatal(msg: impl Into<Cow<'static, str>>) -> Error {
    err(ErrorKind::Fatal, msg)
}

#[test]
fn test_error() {
    let e = err(ErrorKind::Inval, "test error");
    assert!(e.is(ErrorKind::Inval));
    assert_eq!(e.kind().as_str(), "INVAL");
}
