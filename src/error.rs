use serde_derive::{Deserialize, Serialize};

/// A braid error. Errors are owned and cloneable so they can cross fiber
/// frames, be stored in futures, and travel inside client replies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried, typically because of a
    /// leader change, a lost election, or group shutdown.
    Abort,
    /// Invalid data, e.g. log corruption, CRC mismatches, or decode failures.
    InvalidData(String),
    /// Invalid user input or API misuse.
    InvalidInput(String),
    /// An input/output error.
    IO(String),
    /// The fiber was interrupted while suspended, typically during shutdown.
    Interrupt,
    /// The request was routed to a node that isn't the leader. Carries the
    /// last known leader's node ID, or 0 if unknown.
    NotLeader(u32),
    /// The operation timed out, either a fiber wait or a client request
    /// deadline that passed before the entry was applied.
    Timeout,
}

/// Constructs an Error::InvalidData via format!().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Interrupt => write!(f, "fiber interrupted"),
            Error::NotLeader(0) => write!(f, "not leader, leader unknown"),
            Error::NotLeader(id) => write!(f, "not leader, leader is node {id}"),
            Error::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl Error {
    /// Returns whether the error is considered transient for storage retry
    /// purposes. Only IO errors are retried; corruption never is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::IO(_))
    }
}

/// A braid result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Constructs a Result::Err from an Error via into(), used by the errdata!
/// and errinput! macros in return position.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::IO(err.to_string())
    }
}
