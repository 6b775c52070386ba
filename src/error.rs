//! Error types for the VEXL compiler.
//!
//! Every fallible operation in the crate returns [`Result`]. The numeric
//! codes returned by [`Error::code`] are part of the stable external
//! surface; embedders that bridge to C keep them as-is.

use thiserror::Error;

/// Main error type for compilation and the embedding API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("out of memory")]
    NoMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Parser rejected the source. Carries the byte position of the first
    /// offending token.
    #[error("syntax error at byte {position}")]
    InvalidSyntax { position: u32 },

    #[error("symbol not found")]
    SymbolNotFound,

    /// A built-in symbol collided with a layout member or object name.
    #[error("symbol collision")]
    SymbolCollision,

    #[error("symbol already exists")]
    AlreadyExists,

    #[error("invalid cast")]
    InvalidCast,

    #[error("operator not defined for operand types")]
    InvalidOperator,

    #[error("type mismatch")]
    TypeMismatch,

    #[error("too many layout members")]
    TooManyMembers,

    #[error("layout already configured")]
    AlreadyConfigured,

    /// Register allocation, instruction encoding, finalization or
    /// executable-memory failure in the backend. Internal IR-invariant
    /// violations are also reported under this code.
    #[error("JIT compilation failed: {0}")]
    JitFailed(&'static str),
}

impl Error {
    /// Stable numeric code for this error. `0` is reserved for success.
    pub fn code(&self) -> u32 {
        match self {
            Error::NoMemory => 1,
            Error::InvalidArgument(_) => 2,
            Error::InvalidState(_) => 3,
            Error::InvalidSyntax { .. } => 4,
            Error::SymbolNotFound => 5,
            Error::SymbolCollision => 6,
            Error::AlreadyExists => 7,
            Error::InvalidCast => 8,
            Error::InvalidOperator => 9,
            Error::TypeMismatch => 10,
            Error::TooManyMembers => 11,
            Error::AlreadyConfigured => 12,
            Error::JitFailed(_) => 13,
        }
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::NoMemory.code(), 1);
        assert_eq!(Error::InvalidSyntax { position: 7 }.code(), 4);
        assert_eq!(Error::InvalidCast.code(), 8);
        assert_eq!(Error::TooManyMembers.code(), 11);
        assert_eq!(Error::JitFailed("encode").code(), 13);
    }

    #[test]
    fn display_formats() {
        let err = Error::InvalidSyntax { position: 12 };
        assert_eq!(err.to_string(), "syntax error at byte 12");
        assert_eq!(
            Error::InvalidArgument("numArgs").to_string(),
            "invalid argument: numArgs"
        );
    }
}
