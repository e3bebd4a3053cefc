//! Error kinds shared by every operation in the crate.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds for definition construction, product access, and cursor
/// navigation.
///
/// Message payloads are preformatted; nested evaluator failures get the
/// cursor path appended through [`Error::with_context`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Field or array index out of range.
    #[error("invalid index: {0}")]
    InvalidIndex(String),
    /// Operation called on a type class that does not support it.
    #[error("invalid type: {0}")]
    InvalidType(String),
    /// Unknown field or product variable name.
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("cannot move to parent, already at the root of the product")]
    NoParent,
    #[error("array out of bounds: {0}")]
    ArrayOutOfBounds(String),
    #[error("array dimensions mismatch: {0}")]
    ArrayNumDimsMismatch(String),
    /// Construction-time constraint violation in a definition.
    #[error("data definition error: {0}")]
    DataDefinition(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("could not open file: {0}")]
    FileOpen(String),
    #[error("could not read from file: {0}")]
    FileRead(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    /// Data in the product is inconsistent with its definition.
    #[error("product error: {0}")]
    Product(String),
    #[error("HDF4 is not supported in this build")]
    NoHdf4Support,
    #[error("HDF5 is not supported in this build")]
    NoHdf5Support,
    #[error("unsupported product file{}", fmt_optional(.0))]
    UnsupportedProduct(Option<String>),
}

fn fmt_optional(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(": {detail}"),
        None => String::new(),
    }
}

impl Error {
    /// Append `context` to the error message, keeping the kind.
    ///
    /// Used when a nested evaluation fails, e.g. appending
    /// " for dim[2] expression at /mph/dsrs[3]" to the inner error.
    pub fn with_context(self, context: &str) -> Self {
        match self {
            Error::InvalidArgument(msg) => Error::InvalidArgument(msg + context),
            Error::InvalidIndex(msg) => Error::InvalidIndex(msg + context),
            Error::InvalidType(msg) => Error::InvalidType(msg + context),
            Error::InvalidName(msg) => Error::InvalidName(msg + context),
            Error::ArrayOutOfBounds(msg) => {
                Error::ArrayOutOfBounds(msg + context)
            }
            Error::ArrayNumDimsMismatch(msg) => {
                Error::ArrayNumDimsMismatch(msg + context)
            }
            Error::DataDefinition(msg) => Error::DataDefinition(msg + context),
            Error::OutOfMemory(msg) => Error::OutOfMemory(msg + context),
            Error::FileOpen(msg) => Error::FileOpen(msg + context),
            Error::FileRead(msg) => Error::FileRead(msg + context),
            Error::FileNotFound(msg) => Error::FileNotFound(msg + context),
            Error::Product(msg) => Error::Product(msg + context),
            Error::UnsupportedProduct(detail) => Error::UnsupportedProduct(
                Some(detail.unwrap_or_default() + context),
            ),
            other @ (Error::NoParent
            | Error::NoHdf4Support
            | Error::NoHdf5Support) => other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::FileNotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => {
                Error::FileOpen(err.to_string())
            }
            _ => Error::FileRead(err.to_string()),
        }
    }
}
