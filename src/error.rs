//! Error handling utils.
//!
//! Failures inside the runtime are localized to the owning fiber and never
//! tear down the scheduler. Transient conditions (`EINTR`, `EAGAIN`) are
//! absorbed by the hook layer; everything else surfaces through [`Error`].
//! Errno-carrying failures travel as [`std::io::Error`] wrapped by the
//! corresponding variant.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// A hooked call armed a timeout and it fired before readiness.
    /// The operation has not completed.
    #[error("operation timed out")]
    TimedOut,

    #[error("failed to resolve address '{0}'")]
    Resolve(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// Readiness interest for this (fd, event) pair is already registered.
    #[error("event {1:?} already armed on fd {0}")]
    EventArmed(i32, crate::reactor::EventSet),

    #[error("config: {0}")]
    Config(String),

    #[error("byte buffer read past the end")]
    BufferUnderflow,

    #[error("failed to parse http request: {0}")]
    HttpParse(#[from] crate::http::ParseError),

    /// This should only be used if the error doesn't fall into one of the
    /// above categories.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::IO(_) => "IO",
            Self::TimedOut => "TimedOut",
            Self::Resolve(_) => "Resolve",
            Self::InvalidAddress(_) => "InvalidAddress",
            Self::EventArmed(..) => "EventArmed",
            Self::Config(_) => "Config",
            Self::BufferUnderflow => "BufferUnderflow",
            Self::HttpParse(_) => "HttpParse",
            Self::Other(_) => "Other",
        }
    }

    /// `true` if the underlying os error is `ETIMEDOUT` or the error is
    /// [`Error::TimedOut`] itself.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::TimedOut => true,
            Self::IO(e) => e.raw_os_error() == Some(libc::ETIMEDOUT),
            _ => false,
        }
    }
}
