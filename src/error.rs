//! Error taxonomy for the index.
//!
//! Every failure mode is a distinct variant so callers can branch on the
//! outcome of an operation (`Conflict` on duplicate insert, `NoSpace` on
//! free-list exhaustion, and so on). I/O errors from the block store are
//! propagated unchanged. No variant is ever recovered silently and the
//! engine performs no retries; `BadConfig` and `Insane` fail the operation
//! but do not poison the index.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The key is not present in the index (lookup/update).
    #[error("key not found")]
    Nonexistent,

    /// The key is already present (insert rejects duplicates).
    #[error("key already present")]
    Conflict,

    /// The free list is exhausted.
    #[error("no free blocks left")]
    NoSpace,

    /// A key, value, or block buffer does not have the configured width.
    #[error("{what} length {actual} does not match configured length {expected}")]
    Size {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// An accessor index fell outside the valid range.
    #[error("index {idx} out of bounds (len {len})")]
    OutOfBounds { idx: usize, len: usize },

    /// A structural invariant does not hold.
    #[error("structural invariant violated: {0}")]
    BadConfig(String),

    /// A state that cannot be reached on an intact index, e.g. an
    /// unrecognized node type where a tree node must appear.
    #[error("corrupt index: {0}")]
    Insane(String),

    /// The operation is intentionally not implemented.
    #[error("operation not implemented")]
    Unimplemented,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_transparently() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err: Error = io.into();

        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "disk on fire");
    }

    #[test]
    fn size_error_names_the_field() {
        let err = Error::Size {
            what: "key",
            expected: 8,
            actual: 3,
        };

        assert_eq!(
            err.to_string(),
            "key length 3 does not match configured length 8"
        );
    }
}
