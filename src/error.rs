//! Error utilities for the proxy and for hook implementations.
//!
//! The crate reports failures through two shapes:
//!
//! - [`BoxError`], a boxed [`std::error::Error`] trait object, used wherever
//!   the concrete error type does not matter, only that the session or call
//!   failed;
//! - [`OpaqueError`], a thin named wrapper around [`BoxError`] for public
//!   signatures that want a nominal type.
//!
//! The [`ErrorContext`] extension trait attaches call-site context to
//! `Result` and `Option` values, enabling idiomatic `?` short-circuiting
//! with enriched errors.

use std::error::Error;
use std::fmt;

/// A boxed [`std::error::Error`] trait object.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// An opaque error, hiding the concrete type of the failure it wraps.
pub struct OpaqueError(BoxError);

impl OpaqueError {
    /// Wrap any error into an [`OpaqueError`].
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self(error.into())
    }

    /// Create an [`OpaqueError`] from a display-able message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Box::new(MessageError(message.into())))
    }

    /// Turn this error back into a [`BoxError`].
    #[must_use]
    pub fn into_box_error(self) -> BoxError {
        self.0
    }
}

impl fmt::Debug for OpaqueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for OpaqueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Error for OpaqueError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}

struct MessageError(String);

impl fmt::Debug for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Error for MessageError {}

struct ContextError {
    context: String,
    source: BoxError,
}

impl fmt::Debug for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.context, self.source)
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.source)
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Extends `Result` and `Option` with methods for attaching context
/// to the failure case.
pub trait ErrorContext<T>: private::Sealed {
    /// Attach static context to the error.
    fn context(self, context: &'static str) -> Result<T, OpaqueError>;

    /// Attach lazily-computed context to the error.
    fn with_context<F, C>(self, context: F) -> Result<T, OpaqueError>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E: Into<BoxError>> ErrorContext<T> for Result<T, E> {
    fn context(self, context: &'static str) -> Result<T, OpaqueError> {
        self.map_err(|err| {
            OpaqueError(Box::new(ContextError {
                context: context.to_owned(),
                source: err.into(),
            }))
        })
    }

    fn with_context<F, C>(self, context: F) -> Result<T, OpaqueError>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| {
            OpaqueError(Box::new(ContextError {
                context: context().into(),
                source: err.into(),
            }))
        })
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, context: &'static str) -> Result<T, OpaqueError> {
        self.ok_or_else(|| OpaqueError::msg(context))
    }

    fn with_context<F, C>(self, context: F) -> Result<T, OpaqueError>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.ok_or_else(|| OpaqueError::msg(context()))
    }
}

mod private {
    pub trait Sealed {}
    impl<T, E: Into<super::BoxError>> Sealed for Result<T, E> {}
    impl<T> Sealed for Option<T> {}
}
