/// Result alias that carries the custom [`MoodReaderError`] type.
pub type Result<T> = std::result::Result<T, MoodReaderError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum MoodReaderError {
    /// Free-form failure that does not warrant its own variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON in configuration, documents or progress files.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Transport failure while talking to the mood-analysis service.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The analysis service rejected the credential. Callers must force a
    /// re-authentication instead of retrying.
    #[error("mood analysis rejected the credential: {0}")]
    Unauthorized(String),
    /// Any other non-success status from the analysis service.
    #[error("mood analysis failed with status {status}: {message}")]
    Backend { status: u16, message: String },
    /// The model response could not be parsed, even after sanitising it.
    #[error("could not parse mood analysis response: {0}")]
    Parse(String),
    #[error("page {0} is unavailable")]
    PageUnavailable(u32),
    #[error("audio playback failed: {0}")]
    Playback(String),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
}

impl MoodReaderError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Maps a non-success HTTP status from the analysis service.
    pub fn from_status_code(code: u16, message: impl Into<String>) -> Self {
        match code {
            401 | 403 => Self::Unauthorized(message.into()),
            _ => Self::Backend {
                status: code,
                message: message.into(),
            },
        }
    }

    /// True when the failure requires the user to sign in again.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl From<&str> for MoodReaderError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for MoodReaderError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_auth_errors() {
        assert!(MoodReaderError::from_status_code(401, "expired").is_auth_error());
        assert!(MoodReaderError::from_status_code(403, "denied").is_auth_error());

        let err = MoodReaderError::from_status_code(500, "boom");
        assert!(!err.is_auth_error());
        assert!(format!("{err}").contains("500"));
    }
}
