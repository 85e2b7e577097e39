//! Repository error taxonomy.
//!
//! Every variant carries the time it was raised and enough context to render
//! a message without walking the source chain.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::chunk::{ChunkId, ChunkPosition};

pub type Result<T, E = RepositoryError> = std::result::Result<T, E>;

pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Upper bound of the random jitter, as a fraction of the backoff delay.
pub const RETRY_JITTER: f64 = 0.1;

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("Chunk not found ({})", describe_lookup(.chunk_id, .position))]
    ChunkNotFound {
        chunk_id: Option<ChunkId>,
        position: Option<ChunkPosition>,
        timestamp: DateTime<Utc>,
    },

    #[error("Chunk {chunk_id} already exists at {position}")]
    DuplicateChunk {
        chunk_id: ChunkId,
        position: ChunkPosition,
        timestamp: DateTime<Utc>,
    },

    #[error("Storage error during {operation}: {message}")]
    Storage {
        operation: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        timestamp: DateTime<Utc>,
    },

    #[error("Validation failed for {field} = {value}: {constraint}")]
    Validation {
        field: String,
        value: String,
        constraint: String,
        timestamp: DateTime<Utc>,
    },

    #[error("Data integrity violation: expected {expected}, found {actual}")]
    DataIntegrity {
        expected: String,
        actual: String,
        checksum: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[error("Network error calling {endpoint}: {message}")]
    Network {
        endpoint: String,
        message: String,
        status_code: Option<u16>,
        timestamp: DateTime<Utc>,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
        timestamp: DateTime<Utc>,
    },

    #[error("Permission denied: {operation} on {resource}")]
    Permission {
        operation: String,
        resource: String,
        timestamp: DateTime<Utc>,
    },

    #[error("Resource limit exceeded for {resource}: {current}/{limit}")]
    ResourceLimit {
        resource: String,
        limit: u64,
        current: u64,
        timestamp: DateTime<Utc>,
    },
}

fn describe_lookup(chunk_id: &Option<ChunkId>, position: &Option<ChunkPosition>) -> String {
    match (chunk_id, position) {
        (Some(id), Some(pos)) => format!("id {} at {}", id, pos),
        (Some(id), None) => format!("id {}", id),
        (None, Some(pos)) => format!("position {}", pos),
        (None, None) => "no lookup key".to_string(),
    }
}

impl RepositoryError {
    pub fn not_found(chunk_id: Option<ChunkId>, position: Option<ChunkPosition>) -> Self {
        Self::ChunkNotFound { chunk_id, position, timestamp: Utc::now() }
    }

    pub fn not_found_id(chunk_id: ChunkId) -> Self {
        Self::not_found(Some(chunk_id), None)
    }

    pub fn not_found_position(position: ChunkPosition) -> Self {
        Self::not_found(None, Some(position))
    }

    pub fn duplicate(position: ChunkPosition) -> Self {
        Self::DuplicateChunk { chunk_id: ChunkId::for_position(position), position, timestamp: Utc::now() }
    }

    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage { operation: operation.into(), message: message.into(), source: None, timestamp: Utc::now() }
    }

    pub fn storage_caused_by<E>(operation: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            operation: operation.into(),
            message: cause.to_string(),
            source: Some(Box::new(cause)),
            timestamp: Utc::now(),
        }
    }

    pub fn validation(field: impl Into<String>, value: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            value: value.into(),
            constraint: constraint.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn integrity(expected: impl Into<String>, actual: impl Into<String>, checksum: Option<String>) -> Self {
        Self::DataIntegrity { expected: expected.into(), actual: actual.into(), checksum, timestamp: Utc::now() }
    }

    pub fn network(endpoint: impl Into<String>, message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Network { endpoint: endpoint.into(), message: message.into(), status_code, timestamp: Utc::now() }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout { operation: operation.into(), timeout, timestamp: Utc::now() }
    }

    pub fn permission(operation: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::Permission { operation: operation.into(), resource: resource.into(), timestamp: Utc::now() }
    }

    pub fn resource_limit(resource: impl Into<String>, limit: u64, current: u64) -> Self {
        Self::ResourceLimit { resource: resource.into(), limit, current, timestamp: Utc::now() }
    }

    /// Short tag for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChunkNotFound { .. } => "ChunkNotFound",
            Self::DuplicateChunk { .. } => "DuplicateChunk",
            Self::Storage { .. } => "StorageError",
            Self::Validation { .. } => "ValidationError",
            Self::DataIntegrity { .. } => "DataIntegrityError",
            Self::Network { .. } => "NetworkError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Permission { .. } => "PermissionError",
            Self::ResourceLimit { .. } => "ResourceLimitError",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ChunkNotFound { timestamp, .. }
            | Self::DuplicateChunk { timestamp, .. }
            | Self::Storage { timestamp, .. }
            | Self::Validation { timestamp, .. }
            | Self::DataIntegrity { timestamp, .. }
            | Self::Network { timestamp, .. }
            | Self::Timeout { timestamp, .. }
            | Self::Permission { timestamp, .. }
            | Self::ResourceLimit { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Storage { .. } => true,
            Self::ChunkNotFound { .. }
            | Self::DuplicateChunk { .. }
            | Self::Validation { .. }
            | Self::DataIntegrity { .. }
            | Self::Permission { .. }
            | Self::ResourceLimit { .. } => false,
        }
    }

    /// Exponential backoff for the given attempt (0-based): 1s, 2s, 4s ...
    /// capped at 30s, plus up to 10% jitter. Zero for errors that should
    /// not be retried.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if !self.is_retryable() {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = BASE_RETRY_DELAY.saturating_mul(factor).min(MAX_RETRY_DELAY);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..RETRY_JITTER);
        delay + delay.mul_f64(jitter)
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage_caused_by("serialize", err)
    }
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::storage_caused_by("sqlite", err)
    }
}

impl From<tokio_postgres::Error> for RepositoryError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::storage_caused_by("postgres", err)
    }
}

impl From<deadpool_postgres::PoolError> for RepositoryError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::storage_caused_by("postgres pool", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RepositoryError::storage("save", "disk full").is_retryable());
        assert!(RepositoryError::timeout("save", Duration::from_secs(1)).is_retryable());
        assert!(RepositoryError::network("db", "refused", None).is_retryable());

        assert!(!RepositoryError::not_found_position(ChunkPosition::new(0, 0)).is_retryable());
        assert!(!RepositoryError::validation("blocks", "3", "too short").is_retryable());
        assert!(!RepositoryError::permission("write", "chunks").is_retryable());
        assert!(!RepositoryError::resource_limit("memory", 10, 11).is_retryable());
    }

    #[test]
    fn test_retry_delay_backoff_and_cap() {
        let err = RepositoryError::storage("save", "busy");
        for attempt in 0..4 {
            let base = Duration::from_secs(1 << attempt);
            let delay = err.retry_delay(attempt);
            assert!(delay >= base, "attempt {attempt}: {delay:?}");
            assert!(delay <= base.mul_f64(1.0 + RETRY_JITTER));
        }
        let capped = err.retry_delay(40);
        assert!(capped >= MAX_RETRY_DELAY);
        assert!(capped <= MAX_RETRY_DELAY.mul_f64(1.0 + RETRY_JITTER));
    }

    #[test]
    fn test_non_retryable_has_no_delay() {
        let err = RepositoryError::integrity("16 blocks", "3 blocks", None);
        assert_eq!(err.retry_delay(3), Duration::ZERO);
    }

    #[test]
    fn test_messages_carry_context() {
        let err = RepositoryError::not_found(Some(ChunkId::for_position(ChunkPosition::new(1, 2))), None);
        assert_eq!(err.to_string(), "Chunk not found (id chunk_1_2)");
        assert_eq!(err.kind(), "ChunkNotFound");

        let err = RepositoryError::not_found_position(ChunkPosition::new(-3, 4));
        assert_eq!(err.to_string(), "Chunk not found (position (-3, 4))");

        let err = RepositoryError::validation("light_level", "99", "must be between 0 and 15");
        assert_eq!(err.to_string(), "Validation failed for light_level = 99: must be between 0 and 15");
    }

    #[test]
    fn test_storage_error_keeps_source() {
        use std::error::Error as _;
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = RepositoryError::storage_caused_by("put", io);
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "Storage error during put: disk gone");
    }
}
