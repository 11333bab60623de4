use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A claim over one or more sstables was denied because another operation
    /// already holds them. The caller retries with its own policy.
    Contention,
    /// A live-view inconsistency. Always fatal.
    Invariant(String),
    /// An IO error. Dispatched to the disk error policy where applicable.
    IO(String),
    /// An sstable or log file could not be decoded.
    Corruption(String),
    /// The obsoletion log could not be committed; recovery is triggered.
    ObsoletionFailed(String),
    /// Invalid user input, typically argument or name parsing errors.
    InvalidInput(String),
    /// A notification subscriber failed. Accumulated, never aborts the
    /// notification pass.
    Subscriber(String),
    /// Several faults accumulated along a partial-failure path.
    Multiple(Vec<Error>),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Contention => write!(f, "sstables already claimed by another operation"),
            Error::Invariant(msg) => write!(f, "invariant violation: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::ObsoletionFailed(msg) => write!(f, "obsoletion log failure: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Subscriber(msg) => write!(f, "subscriber fault: {msg}"),
            Error::Multiple(errors) => {
                write!(f, "{} accumulated faults: [", errors.len())?;
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

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

/// Folds `error` into an accumulated fault chain. Partial-failure paths
/// thread an `Option<Error>` through successive steps instead of
/// short-circuiting, so each step completes as much declared work as it can.
pub fn merge(accumulate: Option<Error>, error: Error) -> Option<Error> {
    match accumulate {
        None => Some(error),
        Some(Error::Multiple(mut chain)) => {
            chain.push(error);
            Some(Error::Multiple(chain))
        }
        Some(first) => Some(Error::Multiple(vec![first, error])),
    }
}

/// Raises the accumulated fault chain, if any. Called once at the end of a
/// partial-failure path.
pub fn maybe_fail(accumulate: Option<Error>) -> Result<()> {
    match accumulate {
        None => Ok(()),
        Some(error) => Err(error),
    }
}
