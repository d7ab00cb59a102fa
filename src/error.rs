use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot find a `{0}` token in the vocabulary")]
    MissingSpecialToken(String),
    #[error("{0}")]
    InvalidArtifact(String),
}

impl From<tokenizers::Error> for EngineError {
    fn from(err: tokenizers::Error) -> Self {
        Self::Tokenizer(err.to_string())
    }
}
