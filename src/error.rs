//! Crate-wide error taxonomy.
//!
//! Errors are classified by kind rather than by origin module so that the
//! status RPC and logs can report them by name with a one-line description.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input or expression.
    #[error("parse error: {0}")]
    Parse(String),

    /// A reader could not materialize a slice from its input.
    #[error("format error: {0}")]
    Format(String),

    /// Operand type does not match the extractor's type.
    #[error("type clash: {operand} against {expected} column")]
    TypeClash { expected: String, operand: String },

    /// A reader hit its batch timeout with events already produced.
    #[error("timeout")]
    Timeout,

    /// A reader exhausted its input.
    #[error("end of input")]
    EndOfInput,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted file does not conform to the expected format.
    #[error("corruption: {0}")]
    Corruption(String),

    #[error("{0}")]
    Unspecified(String),
}

impl Error {
    /// The taxonomy name of this error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Parse(_) => ErrorKind::ParseError,
            Error::Format(_) => ErrorKind::FormatError,
            Error::TypeClash { .. } => ErrorKind::TypeClash,
            Error::Timeout => ErrorKind::Timeout,
            Error::EndOfInput => ErrorKind::EndOfInput,
            Error::Io(_) => ErrorKind::IoError,
            Error::Corruption(_) => ErrorKind::Corruption,
            Error::Unspecified(_) => ErrorKind::Unspecified,
        }
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ParseError,
    FormatError,
    TypeClash,
    Timeout,
    EndOfInput,
    IoError,
    Corruption,
    Unspecified,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ParseError => "parse_error",
            ErrorKind::FormatError => "format_error",
            ErrorKind::TypeClash => "type_clash",
            ErrorKind::Timeout => "timeout",
            ErrorKind::EndOfInput => "end_of_input",
            ErrorKind::IoError => "io_error",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Unspecified => "unspecified",
        };
        f.write_str(name)
    }
}
