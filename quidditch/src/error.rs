use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Bad query: {0}")]
    BadQuery(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Expression evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("Expression decode error: {0}")]
    ExprDecode(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Index engine error: {0}")]
    Engine(#[from] tantivy::TantivyError),
}

pub type Result<T> = std::result::Result<T, Error>;
