//! Errors raised while decoding hash keys.

use thiserror::Error;

/// A hex string that cannot be decoded into a [`HashKey`](crate::HashKey).
///
/// Raised before any I/O takes place, so callers can reject bad keys early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("malformed cache key: empty string")]
    Empty,

    #[error("malformed cache key: odd number of hex digits ({len})")]
    OddLength { len: usize },

    #[error("malformed cache key: invalid hex character {c:?} at index {index}")]
    InvalidCharacter { c: char, index: usize },
}
