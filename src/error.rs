use std::path::PathBuf;
use thiserror::Error;

/// Errors callers may want to tell apart. Everything else travels as
/// `anyhow::Error` with context attached.
#[derive(Error, Debug)]
pub enum GpuConfError {
    /// External utility could not be started
    #[error("failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// External utility exited non-zero
    #[error("{program} exited with {code}: {stderr}")]
    Exec {
        program: String,
        code: String,
        stderr: String,
    },

    /// A configuration file was read but its content is not valid JSON
    #[error("invalid JSON in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} backend not supported")]
    UnknownBackend(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Requested NVIDIA driver version is not installed
    #[error("NVIDIA driver version {0} is not installed")]
    UnknownVersion(String),
}

impl GpuConfError {
    pub fn exec(program: impl Into<String>, code: Option<i32>, stderr: &[u8]) -> Self {
        Self::Exec {
            program: program.into(),
            code: code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }
}
