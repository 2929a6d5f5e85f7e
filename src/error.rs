use std::{fmt, io};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Internal = 1,
    Usage = 2,
    Cancelled = 3,
    Format = 4,
    NotImplemented = 5,
    TooLong = 6,
    Syntax = 7,
    NoVariable = 8,
    NoType = 9,
    TypeMismatch = 10,
    Runtime = 11,
    Sanity = 12,
    // Memory provider couldn't read the requested range.
    Unreadable = 13,
    // Rule argument didn't match the rule's argument schema, or didn't make sense for the value it was applied to.
    RuleArgument = 14,
    UnknownRule = 15,
    NotContainer = 16,
    ProcessState = 17,
}

#[derive(Debug)]
pub enum ErrorEnum {
    IO(io::Error),
    Code(ErrorCode),
}

#[derive(Clone)]
pub struct Error {
    pub error: ErrorEnum,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: ErrorCode, message: String) -> Error {
        Error {error: ErrorEnum::Code(code), message}
    }

    pub fn from_io_error(e: io::Error, message: String) -> Error {
        Error {error: ErrorEnum::IO(e), message}
    }

    pub fn code(&self) -> Option<ErrorCode> { match self.error { ErrorEnum::Code(c) => Some(c), _ => None } }

    pub fn is_cancelled(&self) -> bool { self.code() == Some(ErrorCode::Cancelled) }
    pub fn is_unreadable(&self) -> bool { self.code() == Some(ErrorCode::Unreadable) }
    pub fn is_rule_argument(&self) -> bool { self.code() == Some(ErrorCode::RuleArgument) }
    pub fn is_unknown_rule(&self) -> bool { self.code() == Some(ErrorCode::UnknownRule) }
    pub fn is_too_long(&self) -> bool { self.code() == Some(ErrorCode::TooLong) }
    pub fn is_type_mismatch(&self) -> bool { self.code() == Some(ErrorCode::TypeMismatch) }
    pub fn is_io_not_found(&self) -> bool { match &self.error { ErrorEnum::IO(e) if e.kind() == io::ErrorKind::NotFound => true, _ => false, } }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error {error: ErrorEnum::IO(error), message: String::new()}
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<std::num::ParseFloatError> for Error {
    fn from(error: std::num::ParseFloatError) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(error: std::str::Utf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<std::fmt::Error> for Error {
    fn from(error: std::fmt::Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

// For printing to log.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(code) => write!(f, "{}: {}", code as i64, self.message),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

// For showing to the user.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(_) => write!(f, "{}", self.message),
            ErrorEnum::IO(error) if self.message.is_empty() => write!(f, "{}", error),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

impl Clone for ErrorEnum {
    fn clone(&self) -> Self {
        match self {
            Self::Code(c) => Self::Code(*c),
            Self::IO(e) => Self::IO(match e.raw_os_error() {
                Some(os) => io::Error::from_raw_os_error(os),
                None => e.kind().into(),
            }),
        }
    }
}

#[macro_export]
macro_rules! error {
    ($code:ident, $($arg:tt)*) => (
        $crate::error::Error {error: $crate::error::ErrorEnum::Code($crate::error::ErrorCode::$code), message: format!($($arg)*)}
    );
}

#[macro_export]
macro_rules! err {
    ($code:ident, $($arg:tt)*) => (
        Err($crate::error!($code, $($arg)*))
    );
}

#[macro_export]
macro_rules! errno_err {
    ($($arg:tt)*) => (
        Err($crate::error::Error {error: $crate::error::ErrorEnum::IO(::std::io::Error::last_os_error()), message: format!($($arg)*)})
    );
}

#[cfg(test)]
mod tests {
    use crate::{*, error::*};

    #[test]
    fn codes_and_display() {
        let e = error!(RuleArgument, "array() expects an expression");
        assert!(e.is_rule_argument());
        assert!(!e.is_unreadable());
        assert_eq!(format!("{}", e), "array() expects an expression");
        assert_eq!(format!("{:?}", e), "14: array() expects an expression");

        let r: Result<()> = err!(Cancelled, "cancelled");
        assert!(r.unwrap_err().is_cancelled());

        let io = Error::from_io_error(io::Error::from(io::ErrorKind::NotFound), "open".to_string());
        assert!(io.clone().is_io_not_found());
        assert_eq!(io.code(), None);
    }
}
