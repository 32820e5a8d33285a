//! Error types for the uz_analysis crate

use std::io;

/// Result type for layer analysis operations
pub type Result<T> = std::result::Result<T, UnravelError>;

/// Error type for layer analysis operations
#[derive(Debug, thiserror::Error)]
pub enum UnravelError {
    /// I/O error from the underlying byte source
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// A read that needed an exact number of bytes hit the end of the source
    #[error("Unexpected end of data while reading {field}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        field: String,
        expected: usize,
        actual: usize,
    },

    /// Magic bytes were present but a header field is invalid
    #[error("Malformed {field}: {reason}")]
    MalformedHeader { field: String, reason: String },

    /// The compressed payload could not be decoded
    #[error("Failed to decode {format} stream: {message}")]
    Decode {
        format: &'static str,
        message: String,
    },
}

impl UnravelError {
    /// Create a new short read error
    pub fn short_read(field: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShortRead {
            field: field.into(),
            expected,
            actual,
        }
    }

    /// Create a new malformed header error
    pub fn malformed_header(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedHeader {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a new decode error
    pub fn decode(format: &'static str, message: impl Into<String>) -> Self {
        Self::Decode {
            format,
            message: message.into(),
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Io(err) => err.kind(),
            Self::ShortRead { .. } => io::ErrorKind::UnexpectedEof,
            Self::MalformedHeader { .. } | Self::Decode { .. } => io::ErrorKind::InvalidData,
        }
    }
}

// The readers in this crate implement `std::io::Read`, so their errors travel
// through `io::Error`. These two conversions make that trip lossless.

impl From<UnravelError> for io::Error {
    fn from(err: UnravelError) -> Self {
        match err {
            UnravelError::Io(err) => err,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

impl From<io::Error> for UnravelError {
    fn from(err: io::Error) -> Self {
        if !err
            .get_ref()
            .is_some_and(|inner| inner.is::<UnravelError>())
        {
            return Self::Io(err);
        }

        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<UnravelError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Self::Io(io::Error::new(kind, other)),
            None => Self::Io(kind.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_round_trip_through_io_error() {
        let err = UnravelError::malformed_header("flags", "reserved bits set");
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);

        let back = UnravelError::from(io_err);
        assert_matches!(back, UnravelError::MalformedHeader { field, .. } if field == "flags");
    }

    #[test]
    fn test_short_read_maps_to_unexpected_eof() {
        let io_err: io::Error = UnravelError::short_read("magic", 2, 1).into();
        assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_plain_io_error_is_kept() {
        let err = UnravelError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert_matches!(err, UnravelError::Io(inner) if inner.kind() == io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_error_messages_name_the_field() {
        let err = UnravelError::malformed_header("compression method", "expected deflate (8), got 3");
        assert_eq!(
            err.to_string(),
            "Malformed compression method: expected deflate (8), got 3"
        );
    }
}
