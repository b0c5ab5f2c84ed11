use std::io;

use thiserror::Error;

use crate::location::LocationError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error("{0}")]
    Config(String),
    #[error("remote api returned an unusable response: {0}")]
    Api(String),
}
