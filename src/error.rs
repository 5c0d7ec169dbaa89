use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unsupported {kind} type: {tag:?}")]
    UnsupportedType { kind: &'static str, tag: String },

    #[error("Delivery failed for {}", describe_failures(.0))]
    Delivery(Vec<SinkFailure>),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// One sink that could not take the batch.
#[derive(Debug)]
pub struct SinkFailure {
    pub sink: String,
    pub error: CollectorError,
}

impl fmt::Display for SinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink {:?} ({})", self.sink, self.error)
    }
}

fn describe_failures(failures: &[SinkFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl CollectorError {
    /// Names of the sinks that failed, empty for every other variant.
    pub fn failed_sinks(&self) -> Vec<&str> {
        match self {
            CollectorError::Delivery(failures) => {
                failures.iter().map(|f| f.sink.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl From<duckdb::Error> for CollectorError {
    fn from(err: duckdb::Error) -> Self {
        CollectorError::Query(err.to_string())
    }
}

impl From<sqlx::Error> for CollectorError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => CollectorError::Connection(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                CollectorError::Decode(err.to_string())
            }
            _ => CollectorError::Query(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CollectorError::Decode(err.to_string())
        } else {
            CollectorError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(err: serde_json::Error) -> Self {
        CollectorError::Decode(err.to_string())
    }
}

impl From<serde_yaml::Error> for CollectorError {
    fn from(err: serde_yaml::Error) -> Self {
        CollectorError::Config(err.to_string())
    }
}

impl IntoResponse for CollectorError {
    fn into_response(self) -> Response {
        let status = match self {
            CollectorError::Config(_)
            | CollectorError::Decode(_)
            | CollectorError::UnsupportedType { .. } => StatusCode::BAD_REQUEST,
            CollectorError::Connection(_)
            | CollectorError::Http(_)
            | CollectorError::Delivery(_) => StatusCode::BAD_GATEWAY,
            CollectorError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            CollectorError::Query(_)
            | CollectorError::Io(_)
            | CollectorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, CollectorError>;
