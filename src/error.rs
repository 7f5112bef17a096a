//! Error types for flowrun.
//!
//! `Error::Execution` carries the human-readable failure text that ends up in
//! a run's submit log; everything else is infrastructure.

use thiserror::Error;

/// Result type alias for flowrun operations.
pub type Result<T> = std::result::Result<T, Error>;

/// flowrun error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Work error: {0}")]
    Work(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    /// A run failed. The message is appended verbatim to the run log.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Entity lookup by id came back empty. Fatal for the current tick.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error code, useful for log filtering and API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Work(_) => "WORK_ERROR",
            Error::Workflow(_) => "WORKFLOW_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Agent(_) => "AGENT_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// True when the error means "this run failed", as opposed to an
    /// infrastructure fault in the tick machinery itself.
    pub fn is_run_failure(&self) -> bool {
        matches!(self, Error::Execution(_))
    }
}
