//! Classified storage errors
//!
//! Every failure leaving the storage layer is a [`StorageError`] carrying a
//! stable string id, the `STORAGE` domain, a category and free-form details.
//! `USER` errors are caller-correctable; `THIRD_PARTY` errors wrap a driver,
//! pool or serialization failure and keep it as the error source.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorDomain {
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Backend, driver or connectivity failure.
    ThirdParty,
    /// Condition the caller can correct (bad input, missing thread, ...).
    User,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ThirdParty => "THIRD_PARTY",
            ErrorCategory::User => "USER",
        }
    }
}

#[derive(Debug, Error)]
#[error("{id}: {message}")]
pub struct StorageError {
    pub id: String,
    pub domain: ErrorDomain,
    pub category: ErrorCategory,
    pub details: Map<String, Value>,
    pub message: String,
    #[source]
    source: Option<BoxError>,
}

impl StorageError {
    pub fn user(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: ErrorDomain::Storage,
            category: ErrorCategory::User,
            details: Map::new(),
            message: message.into(),
            source: None,
        }
    }

    pub fn third_party(id: impl Into<String>, source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self {
            id: id.into(),
            domain: ErrorDomain::Storage,
            category: ErrorCategory::ThirdParty,
            details: Map::new(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Re-brands a backend error with the id of the operation that failed.
    /// The original error becomes the source and its details carry over.
    fn wrap(id: &str, inner: StorageError) -> Self {
        Self {
            id: id.to_string(),
            domain: ErrorDomain::Storage,
            category: ErrorCategory::ThirdParty,
            details: inner.details.clone(),
            message: inner.message.clone(),
            source: Some(Box::new(inner)),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn is_user(&self) -> bool {
        self.category == ErrorCategory::User
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::third_party("STORAGE_SQLITE_QUERY_FAILED", e)
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(e: r2d2::Error) -> Self {
        StorageError::third_party("STORAGE_POOL_CHECKOUT_FAILED", e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::third_party("STORAGE_JSON_SERIALIZATION_FAILED", e)
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::third_party("STORAGE_TASK_JOIN_FAILED", e)
    }
}

/// Classification helpers for results flowing out of an operation.
pub trait StorageResultExt<T> {
    /// Tags a `THIRD_PARTY` failure with the operation id; `USER` errors
    /// pass through untouched so their specific id survives.
    fn classify(self, id: &str) -> Result<T>;

    fn detail(self, key: &str, value: impl Into<Value>) -> Result<T>;
}

impl<T, E> StorageResultExt<T> for std::result::Result<T, E>
where
    E: Into<StorageError>,
{
    fn classify(self, id: &str) -> Result<T> {
        self.map_err(|e| {
            let e = e.into();
            if e.is_user() {
                e
            } else {
                StorageError::wrap(id, e)
            }
        })
    }

    fn detail(self, key: &str, value: impl Into<Value>) -> Result<T> {
        self.map_err(|e| e.into().with_detail(key, value))
    }
}
