use thiserror::Error;

#[derive(Error, Debug)]
pub enum CmdRunnerError {
    #[error("Failed to launch '{executable}': {source}")]
    LaunchFailure {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid execution request: {0}")]
    InvalidRequest(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Network error: {0}")]
    NetworkError(String),
}

impl CmdRunnerError {
    /// True when the OS refused to start the process.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, CmdRunnerError::LaunchFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, CmdRunnerError>;
