use thiserror::Error;

/// Errors that can occur while decoding a ROM or save file.
#[derive(Debug, Error)]
pub enum ParseError {
    /// No parser recognised the input. Not an error to the host.
    #[error("File format not supported")]
    NotSupported,

    /// I/O error while reading the source stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structure validation failed after detection
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// A required encryption key is not loaded
    #[error("Missing encryption key: {0}")]
    MissingKey(String),

    /// A key was loaded but failed plaintext verification
    #[error("Wrong encryption key: {0}")]
    WrongKey(String),

    /// A header-provided size exceeds the file size
    #[error("Size field overflow: {0}")]
    Overflow(String),
}

impl ParseError {
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }

    pub fn missing_key(name: impl Into<String>) -> Self {
        Self::MissingKey(name.into())
    }

    pub fn wrong_key(name: impl Into<String>) -> Self {
        Self::WrongKey(name.into())
    }

    pub fn overflow(msg: impl Into<String>) -> Self {
        Self::Overflow(msg.into())
    }

    /// Compact error kind for `last_error`-style reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotSupported => ErrorKind::NotSupported,
            Self::Io(_) => ErrorKind::Io,
            Self::InvalidFormat(_) => ErrorKind::InvalidFormat,
            Self::MissingKey(_) => ErrorKind::MissingKey,
            Self::WrongKey(_) => ErrorKind::WrongKey,
            Self::Overflow(_) => ErrorKind::Overflow,
        }
    }
}

/// Discriminant-only view of [`ParseError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotSupported,
    Io,
    InvalidFormat,
    MissingKey,
    WrongKey,
    Overflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ParseError::NotSupported.kind(), ErrorKind::NotSupported);
        assert_eq!(
            ParseError::invalid_format("x").kind(),
            ErrorKind::InvalidFormat
        );
        assert_eq!(
            ParseError::missing_key("ctr-Slot0x3DKeyX").kind(),
            ErrorKind::MissingKey
        );
        assert_eq!(ParseError::wrong_key("k").kind(), ErrorKind::WrongKey);
        assert_eq!(ParseError::overflow("size").kind(), ErrorKind::Overflow);
    }

    #[test]
    fn test_error_display() {
        let err = ParseError::missing_key("ctr-Slot0x3DKeyY-0");
        assert_eq!(
            err.to_string(),
            "Missing encryption key: ctr-Slot0x3DKeyY-0"
        );
    }
}
