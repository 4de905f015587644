use thiserror::Error;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Not implemented: {0}")]
    Unsupported(String),

    #[error("Validation error at '{path}': {message}")]
    Validation { path: String, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Server error (code {code}): {message}")]
    Server { code: u32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TargetError {
    /// ClickHouse error codes returned when a column type transition cannot be applied.
    const UNSUPPORTED_ALTER_CODES: [u32; 4] = [
        48,  // NOT_IMPLEMENTED
        70,  // CANNOT_CONVERT_TYPE
        473, // ALTER_OF_COLUMN_IS_FORBIDDEN (pre 21.x)
        524, // ALTER_OF_COLUMN_IS_FORBIDDEN
    ];

    /// True when the database refused an ALTER because the type transition is unsupported.
    pub fn is_unsupported_alteration(&self) -> bool {
        match self {
            TargetError::Unsupported(_) => true,
            TargetError::Server { code, .. } => Self::UNSUPPORTED_ALTER_CODES.contains(code),
            _ => false,
        }
    }

    /// Errors the pipeline can log and skip instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TargetError::Validation { .. })
    }
}

pub type Result<T> = std::result::Result<T, TargetError>;
