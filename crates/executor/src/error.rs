use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Browser error: {0}")]
    Browser(String),
    #[error("Not configured: {0}")]
    NotConfigured(String),
}
