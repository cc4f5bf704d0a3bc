use std::fmt;

use crate::{holder::HolderType, path::ParsePathError};

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The primary error type used throughout this library.
#[derive(Debug)]
pub struct Error {
    inner: ErrorKind,
}

impl Error {
    pub(crate) fn from(e: impl Into<ErrorKind>) -> Self {
        Self { inner: e.into() }
    }

    /// Creates an error reporting that a message could not be delivered, or that the remote peer
    /// answered it with an error.
    ///
    /// [`Connection`][crate::Connection] implementations should use this for every failure of the
    /// round-trip itself.
    pub fn send_failed(source: impl Into<BoxError>) -> Self {
        Self::from(ErrorKind::SendFailed(source.into()))
    }

    /// Creates an error carrying only a message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::from(ErrorKind::Other(message.into()))
    }

    pub(crate) fn wrong_variant_type(expected: impl Into<String>, found: HolderType) -> Self {
        Self::from(ErrorKind::WrongVariantType {
            expected: expected.into(),
            found,
        })
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::from(ErrorKind::NotFound(what.into()))
    }

    pub(crate) fn construction_failed(what: impl Into<String>, source: Error) -> Self {
        Self::from(ErrorKind::ConstructionFailed {
            what: what.into(),
            source: Box::new(source),
        })
    }

    /// Returns whether this error was raised by the transport while sending a message.
    pub fn is_send_failed(&self) -> bool {
        matches!(self.inner, ErrorKind::SendFailed(_))
    }

    /// Returns whether a [`Holder`][crate::Holder] was accessed as a type it does not hold.
    pub fn is_wrong_variant_type(&self) -> bool {
        matches!(self.inner, ErrorKind::WrongVariantType { .. })
    }

    /// Returns whether a malformed object path was encountered.
    pub fn is_invalid_path(&self) -> bool {
        matches!(self.inner, ErrorKind::InvalidPath(_))
    }

    /// Returns whether a property or object that was asked for is not known.
    pub fn is_not_found(&self) -> bool {
        matches!(self.inner, ErrorKind::NotFound(_))
    }

    /// Returns whether a registered constructor failed while materializing part of the tree.
    pub fn is_construction_failed(&self) -> bool {
        matches!(self.inner, ErrorKind::ConstructionFailed { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorKind::InvalidPath(e) => e.fmt(f),
            ErrorKind::WrongVariantType { expected, found } => {
                write!(f, "wrong variant type: expected {}, found {}", expected, found)
            }
            ErrorKind::SendFailed(e) => write!(f, "failed to send message: {}", e),
            ErrorKind::NotFound(what) => write!(f, "{} not found", what),
            ErrorKind::ConstructionFailed { what, source } => {
                write!(f, "failed to construct {}: {}", what, source)
            }
            ErrorKind::Zbus(e) => e.fmt(f),
            ErrorKind::Zvariant(e) => e.fmt(f),
            ErrorKind::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.inner {
            ErrorKind::InvalidPath(e) => Some(e),
            ErrorKind::SendFailed(e) => Some(&**e),
            ErrorKind::ConstructionFailed { source, .. } => Some(&**source),
            ErrorKind::Zbus(e) => Some(e),
            ErrorKind::Zvariant(e) => Some(e),
            ErrorKind::WrongVariantType { .. } | ErrorKind::NotFound(_) | ErrorKind::Other(_) => {
                None
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    InvalidPath(ParsePathError),
    WrongVariantType { expected: String, found: HolderType },
    SendFailed(BoxError),
    NotFound(String),
    ConstructionFailed { what: String, source: Box<Error> },
    Zbus(zbus::Error),
    Zvariant(zbus::zvariant::Error),
    Other(String),
}

impl From<ParsePathError> for ErrorKind {
    fn from(value: ParsePathError) -> Self {
        Self::InvalidPath(value)
    }
}

impl From<zbus::Error> for ErrorKind {
    fn from(value: zbus::Error) -> Self {
        Self::Zbus(value)
    }
}

impl From<zbus::zvariant::Error> for ErrorKind {
    fn from(value: zbus::zvariant::Error) -> Self {
        Self::Zvariant(value)
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

impl From<&str> for ErrorKind {
    fn from(value: &str) -> Self {
        Self::Other(value.to_string())
    }
}

impl From<ParsePathError> for Error {
    fn from(value: ParsePathError) -> Self {
        Error::from(ErrorKind::from(value))
    }
}
