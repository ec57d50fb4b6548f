use std::io;

use thiserror::Error;

use crate::interrupt::Interrupted;

#[derive(Debug, Error)]
pub enum SoakError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("interrupted")]
    Interrupted,
}

impl From<Interrupted> for SoakError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}
