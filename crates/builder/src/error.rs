//! Builder errors

use thiserror::Error;

/// Errors that abort a build
#[derive(Debug, Error)]
pub enum BuilderError {
    /// Required environment variable is unset or empty
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    /// Environment variable holds an unusable value
    #[error("invalid value for {name}: {reason}")]
    InvalidEnv { name: &'static str, reason: String },

    /// The program could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// A command whose output names a resource printed nothing
    #[error("`{0}` printed no output")]
    EmptyOutput(String),
}
