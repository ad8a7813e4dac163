use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpawnlineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Command '{target_path}' exited with non-zero exit code {exit_code}")]
    CommandNotSuccessful { exit_code: i32, target_path: String },

    #[error("Platform not supported: {0}")]
    PlatformNotSupported(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpawnlineError>;
