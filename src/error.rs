//! Error types.
use std::fmt;

use crate::comm::Comm;

/// Errors raised by the distributed SPH core.
#[derive(Debug)]
pub enum SphError {
    /// A precondition of an operation does not hold.
    Precondition(String),

    /// Invalid configuration value.
    Config(String),

    /// A numerical procedure did not converge within its bounds.
    Numerical(String),

    /// An entity refers to a particle array that has been replaced.
    StaleReference {
        /// Index into the particle array.
        index: usize,
        /// Epoch recorded when the reference was created.
        epoch: u64,
        /// Current epoch of the particle array.
        current: u64,
    },

    /// I/O failure
    Io(std::io::Error),

    /// Failure parsing a YAML document.
    Yaml(serde_yaml::Error),
}

impl fmt::Display for SphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SphError::Precondition(e) => write!(f, "Precondition violated: {}", e),
            SphError::Config(e) => write!(f, "Configuration error: {}", e),
            SphError::Numerical(e) => write!(f, "Numerical failure: {}", e),
            SphError::StaleReference {
                index,
                epoch,
                current,
            } => write!(
                f,
                "Stale reference to particle {} (epoch {}, current epoch {})",
                index, epoch, current
            ),
            SphError::Io(e) => write!(f, "I/O error: {}", e),
            SphError::Yaml(e) => write!(f, "YAML error: {}", e),
        }
    }
}

impl std::error::Error for SphError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SphError::Io(e) => Some(e),
            SphError::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SphError {
    fn from(err: std::io::Error) -> Self {
        SphError::Io(err)
    }
}

impl From<serde_yaml::Error> for SphError {
    fn from(err: serde_yaml::Error) -> Self {
        SphError::Yaml(err)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SphError>;

/// Report an unrecoverable error and abort all ranks of `comm`.
pub fn fatal<C: Comm>(comm: &C, message: &str) -> ! {
    tracing::error!(rank = comm.rank(), "{}", message);
    comm.abort(1)
}
