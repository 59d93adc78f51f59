use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Error codes reported through `Event::Error`.
///
/// This is the vocabulary the application sees; deeper failures are folded
/// onto it at the component boundary via [`MppError::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SameState,
    IncorrectStateTransition,
    InvalidState,
    FormatNotDetected,
    BadParameter,
    PortNotCompatible,
    InsufficientResources,
    Undefined,
    Unsupported,
    NullPointer,
    EmptyData,
    ReadFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SameState => "SAME_STATE",
            ErrorCode::IncorrectStateTransition => "INCORRECT_STATE_TRANSITION",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::FormatNotDetected => "FORMAT_NOT_DETECTED",
            ErrorCode::BadParameter => "BAD_PARAMETER",
            ErrorCode::PortNotCompatible => "PORT_NOT_COMPATIBLE",
            ErrorCode::InsufficientResources => "INSUFFICIENT_RESOURCES",
            ErrorCode::Undefined => "UNDEFINED",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::NullPointer => "NULL_POINTER",
            ErrorCode::EmptyData => "EMPTY_DATA",
            ErrorCode::ReadFailed => "READ_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum MppError {
    #[error("component error: {0}")]
    Component(ErrorCode),

    #[error("parser error: {0}")]
    Parser(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("graphics engine error: {0}")]
    Engine(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("thread error: {0}")]
    Thread(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl MppError {
    /// Maps the error onto the event vocabulary.
    pub fn code(&self) -> ErrorCode {
        match self {
            MppError::Component(code) => *code,
            MppError::Parser(_) => ErrorCode::FormatNotDetected,
            MppError::Io(_) => ErrorCode::ReadFailed,
            MppError::Config(_) | MppError::Json(_) => ErrorCode::BadParameter,
            MppError::Thread(_) => ErrorCode::InsufficientResources,
            MppError::Decode(_) | MppError::Render(_) | MppError::Engine(_) | MppError::Image(_) => {
                ErrorCode::Undefined
            }
        }
    }
}

impl From<ErrorCode> for MppError {
    fn from(code: ErrorCode) -> Self {
        MppError::Component(code)
    }
}

pub type Result<T> = std::result::Result<T, MppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(MppError::from(ErrorCode::SameState).code(), ErrorCode::SameState);
        assert_eq!(MppError::Parser("x".into()).code(), ErrorCode::FormatNotDetected);
        assert_eq!(MppError::Render("x".into()).code(), ErrorCode::Undefined);
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(MppError::from(io).code(), ErrorCode::ReadFailed);
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorCode::PortNotCompatible.to_string(), "PORT_NOT_COMPATIBLE");
        assert_eq!(
            MppError::Component(ErrorCode::InvalidState).to_string(),
            "component error: INVALID_STATE"
        );
    }
}
