//! Error related business logic of `clotho`.
//!
//! Contains the `ErrorKind` enum, as well as other useful extensions of
//! the `std::result::Result` type, to work with our very own `Error`
//! type.

use std::error;
use std::fmt;
use std::result;

/// Extension of the standard library's `Result` type,
/// used to wrap its error in a `clotho::causal::error::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from `ResultWrappedExt`, this trait is
/// used in cases where we want to drop the underlying
/// error type in the `Result`. Having this possibility
/// might be useful when the error type in the `Result`
/// doesn't implement `Send`.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg))
    }
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The module a particular `Error` originated from, or the resource
/// class it reports on.
///
/// `Capacity` is special cased: it reports buffer growth hitting its
/// configured byte limit, and producers are expected to retry or fail
/// the task, rather than treat it as a logic error.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Error,
    Determinant,
    DeltaCodec,
    ThreadLog,
    VertexLog,
    JobLog,
    Config,
    Capacity,
}

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

#[derive(Debug)]
enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Error {
    /// Returns an error not wrapping another
    /// error implementation, with kind `ErrorKind`.
    pub fn simple(kind: ErrorKind) -> Self {
        let inner = ErrorInner::Simple(kind);
        Error { inner }
    }

    /// Wraps an arbitrary error in an `Error`,
    /// with kind of type `ErrorKind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        let inner = ErrorInner::Wrapped(kind, e.into());
        Error { inner }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(fmt, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(fmt, "{:?}: {}", k, e),
        }
    }
}

impl error::Error for Error {}
