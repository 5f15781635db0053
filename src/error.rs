use std::fmt::Display;

/// ShaleDB errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Unknown type tag, or a declared width that disagrees with the actual
    /// encoded size.
    Type(String),
    /// Magic, delimiter, version, or header/metadata violations in an
    /// on-disk structure.
    Format(String),
    /// An IO error, with the failing path or operation attached.
    IO(String),
    /// An attempt to write more records into a table than its declared size.
    Capacity { declared: usize, requested: usize },
    /// A sidecar file (index or bloom) disagrees with the data file.
    Invariant(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Type(msg) => write!(f, "type error: {msg}"),
            Error::Format(msg) => write!(f, "format error: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Capacity {
                declared,
                requested,
            } => write!(
                f,
                "capacity exceeded: table holds at most {declared} records, {requested} requested"
            ),
            Error::Invariant(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

/// Constructs an Error::Type for the given format string.
#[macro_export]
macro_rules! errtype {
    ($($args:tt)*) => { $crate::error::Error::Type(format!($($args)*)).into() };
}

/// Constructs an Error::Format for the given format string.
#[macro_export]
macro_rules! errformat {
    ($($args:tt)*) => { $crate::error::Error::Format(format!($($args)*)).into() };
}

/// Constructs an Error::Invariant for the given format string.
#[macro_export]
macro_rules! errinvariant {
    ($($args:tt)*) => { $crate::error::Error::Invariant(format!($($args)*)).into() };
}

/// A ShaleDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

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

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
