use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Vision API transient error: {0}")]
    VisionTransient(String),

    #[error("Vision API error: {0}")]
    VisionFatal(String),

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("Work item store error: {0}")]
    Store(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether another completion attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::VisionTransient(_) => true,
            AppError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Short label used in logs and failure markers.
    pub fn kind(&self) -> &'static str {
        match self {
            _ if self.is_transient() => "transient",
            AppError::Parse(_) => "parse",
            _ => "fatal",
        }
    }
}

impl From<image::ImageError> for AppError {
    fn from(e: image::ImageError) -> Self {
        AppError::Image(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
