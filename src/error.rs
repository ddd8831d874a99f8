//! Pipeline error taxonomy.
//!
//! Startup contract violations and broken scheduler primitives are fatal: a
//! stage loop hands the error back to its task wrapper, which logs it and
//! aborts. Running out of inference input buffers is not an error at all, it
//! is a dropped frame.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("contract violation: {0}")]
    Contract(String),
    #[error("synchronisation primitive failed: {0}")]
    Sync(&'static str),
    #[error("accelerator error: {0}")]
    Accelerator(String),
    #[error("tracker error: {0}")]
    Tracker(String),
    #[error("driver error: {0}")]
    Driver(String),
    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::Contract(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
