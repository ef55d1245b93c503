//! Error types shared by every codec, the array proxy and the conversion pipeline.

use thiserror::Error;

/// Errors raised while reading, writing or converting images and tractograms.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No registered format signature matched the source.
    #[error("unrecognized format: {0}")]
    UnrecognizedFormat(String),

    /// Bad magic, size mismatch or a header field outside its declared range.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Data type code that the format (or this crate) cannot represent.
    #[error("unsupported data type: {0}")]
    UnsupportedDatatype(String),

    /// Affine determinant within tolerance of zero.
    #[error("non-invertible affine (determinant {0:e})")]
    NonInvertibleAffine(f64),

    /// Array shape disagrees with the header-declared dimensions.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Shape declared by the header.
        expected: Vec<usize>,
        /// Shape actually provided.
        actual: Vec<usize>,
    },

    /// Compression or container stream could not be decoded.
    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    /// Target format cannot represent the source.
    #[error("incompatible conversion: {0}")]
    IncompatibleConversion(String),

    /// Crop range outside the image bounds or empty.
    #[error("invalid crop region: {0}")]
    InvalidCropRegion(String),

    /// Write scaling could not be computed.
    #[error("scaling error: {0}")]
    Scaling(String),

    /// Invalid option value or a feature that is not compiled in.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Map an I/O error raised inside a decompressor or a truncated payload
    /// onto `CorruptStream`, keeping other I/O failures as they are.
    pub(crate) fn from_stream(err: std::io::Error, context: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData
            | std::io::ErrorKind::InvalidInput | std::io::ErrorKind::Other => {
                Self::CorruptStream(format!("{context}: {err}"))
            }
            _ => Self::Io(err),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_stream_maps_to_corrupt_stream() {
        let err = Error::from_stream(
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "early eof"),
            "reading voxel data",
        );
        assert!(matches!(err, Error::CorruptStream(_)));
        assert!(err.to_string().contains("reading voxel data"));
    }

    #[test]
    fn permission_errors_stay_io() {
        let err = Error::from_stream(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
            "open",
        );
        assert!(matches!(err, Error::Io(_)));
    }
}
