/// Errors that can occur while turning raw bytes into a transmittable photo
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompressionError {
    /// Input is not a recognized still image; retrying cannot help
    #[error("Image decode error: {0}")]
    Decode(String),
    /// No raster surface could be obtained for drawing
    #[error("Raster surface error: {0}")]
    Surface(String),
    #[error("Image encode error: {0}")]
    Encode(String),
}

impl CompressionError {
    /// Whether the failure is a property of the input rather than of the environment
    pub fn is_permanent(&self) -> bool {
        matches!(self, CompressionError::Decode(_))
    }

    /// User-friendly error message for UI
    pub fn user_message(&self) -> String {
        match self {
            CompressionError::Decode(_) => "The file is not a supported image.".to_string(),
            CompressionError::Surface(_) | CompressionError::Encode(_) => {
                "Error processing image.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_decode_is_permanent() {
        assert!(CompressionError::Decode("x".into()).is_permanent());
        assert!(!CompressionError::Encode("x".into()).is_permanent());
        assert!(!CompressionError::Surface("x".into()).is_permanent());
    }
}
