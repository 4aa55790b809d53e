//! Error surface for the core containers.
//!
//! Kept intentionally small, in the same spirit as the fallible node
//! operations this design is patterned on, which signal failure with a bare
//! `Result<(), ()>` rather than a dedicated error-derive crate: the only two
//! recoverable conditions a caller of these containers can hit are described
//! below. Absent keys are never an `Err` — they are `None`/`false`.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A growth operation (rehash, node split, arena growth) could not
    /// acquire the memory it needed. The container is left exactly as it
    /// was before the call.
    AllocationFailure,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocationFailure => f.write_str("allocation failure"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
