//! Result type definition.

use crate::error::Error;

/// The standard Result type for Quay operations.
///
/// All fallible operations return this type; use `?`, `match`, or combinators.
pub type Result<T> = std::result::Result<T, Error>;
