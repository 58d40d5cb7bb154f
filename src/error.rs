//! `postwire` error types.
use std::{fmt, io};

use crate::{
    config::ParseError,
    protocol::{ProtocolError, backend::Fields},
    result::ResultGroup,
};

/// A specialized [`Result`] type for `postwire` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible errors from the `postwire` library.
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    /// The server error report, when the failure came from the backend.
    pub fn as_db(&self) -> Option<&DbError> {
        match &self.kind {
            ErrorKind::Db(db) => Some(db),
            _ => None,
        }
    }

    pub(crate) fn misuse(reason: &'static str) -> Self {
        ErrorKind::Misuse(Misuse(reason)).into()
    }

    pub(crate) fn closed() -> Self {
        ErrorKind::Closed.into()
    }
}

/// All possible error kinds from the `postwire` library.
pub enum ErrorKind {
    /// Failed to parse the connection configuration.
    Config(ParseError),
    /// The backend sent bytes the codec cannot decode.
    Protocol(ProtocolError),
    /// Transport failure.
    Io(io::Error),
    /// The backend reported an error.
    Db(Box<DbError>),
    /// The server requested an authentication method the driver does not
    /// speak.
    UnsupportedAuth(UnsupportedAuth),
    /// The caller broke a local precondition; nothing was sent.
    Misuse(Misuse),
    /// The connection is closed or failed beyond recovery.
    Closed,
}

macro_rules! from {
    (<$ty:ty> $pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                Self { kind: $body }
            }
        }
    };
}

from!(<ErrorKind> e => e);
from!(<ParseError> e => ErrorKind::Config(e));
from!(<ProtocolError> e => ErrorKind::Protocol(e));
from!(<io::Error> e => ErrorKind::Io(e));
from!(<DbError> e => ErrorKind::Db(Box::new(e)));
from!(<UnsupportedAuth> e => ErrorKind::UnsupportedAuth(e));
from!(<Misuse> e => ErrorKind::Misuse(e));

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Db(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::Misuse(e) => e.fmt(f),
            Self::Closed => f.write_str("connection closed"),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// An error reported by the backend through `ErrorResponse`.
///
/// Carries every field of the report plus any partial result accumulated
/// before the failure.
#[derive(Debug, Default)]
pub struct DbError {
    fields: Fields,
    partial: Option<ResultGroup>,
}

impl DbError {
    pub(crate) fn new(fields: Fields) -> Self {
        Self { fields, partial: None }
    }

    pub(crate) fn with_partial(fields: Fields, partial: Option<ResultGroup>) -> Self {
        Self { fields, partial }
    }

    /// Severity field, e.g. `ERROR`, `FATAL`, `PANIC`.
    pub fn severity(&self) -> &str {
        self.fields.get(b'S').unwrap_or_default()
    }

    /// SQLSTATE code.
    pub fn code(&self) -> &str {
        self.fields.get(b'C').unwrap_or_default()
    }

    /// Primary human-readable message.
    pub fn message(&self) -> &str {
        self.fields.get(b'M').unwrap_or_default()
    }

    pub fn detail(&self) -> Option<&str> {
        self.fields.get(b'D')
    }

    pub fn hint(&self) -> Option<&str> {
        self.fields.get(b'H')
    }

    /// Error cursor position within the original query string.
    pub fn position(&self) -> Option<u32> {
        self.fields.get(b'P')?.parse().ok()
    }

    /// Every reported field, known tags and unknown alike.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Rows and notices accumulated before the failure, for query and
    /// execute errors.
    pub fn partial(&self) -> Option<&ResultGroup> {
        self.partial.as_ref()
    }
}

impl std::error::Error for DbError {}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity(), self.message())
    }
}

/// The server asked for an authentication exchange the driver does not
/// implement.
#[derive(Debug, thiserror::Error)]
#[error("unsupported authentication method: {0}")]
pub struct UnsupportedAuth(pub(crate) &'static str);

/// A local precondition failed before anything reached the wire.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Misuse(pub(crate) &'static str);
