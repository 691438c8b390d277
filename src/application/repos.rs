//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub const DEFAULT_ENDPOINT_TTL_MS: u64 = 300_000;
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 6;
pub const MAX_COMPRESSION_LEVEL: u8 = 9;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// Persisted cache policy for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfigRecord {
    pub endpoint: String,
    pub ttl_ms: u64,
    pub enabled: bool,
    pub compression_enabled: bool,
    pub compression_level: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
    pub access_count: u64,
}

impl EndpointConfigRecord {
    /// Record created implicitly the first time an endpoint is requested.
    pub fn first_access(endpoint: &str, ttl_ms: u64, now: OffsetDateTime) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ttl_ms,
            enabled: true,
            compression_enabled: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            last_modified: now,
            access_count: 1,
        }
    }
}

/// Create-or-update payload. Absent fields keep their stored value, or the
/// default when the record is new.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfigUpsert {
    pub endpoint: String,
    pub ttl_ms: Option<u64>,
    pub enabled: Option<bool>,
    pub compression_enabled: Option<bool>,
    pub compression_level: Option<u8>,
}

impl EndpointConfigUpsert {
    pub fn validate(&self) -> Result<(), RepoError> {
        if !self.endpoint.starts_with('/') {
            return Err(RepoError::invalid_input(format!(
                "endpoint `{}` must start with `/`",
                self.endpoint
            )));
        }
        if self.endpoint.contains('?') {
            return Err(RepoError::invalid_input(
                "endpoint must not include a query string",
            ));
        }
        if let Some(level) = self.compression_level.filter(|level| *level > MAX_COMPRESSION_LEVEL) {
            return Err(RepoError::invalid_input(format!(
                "compression level {level} is outside 0..={MAX_COMPRESSION_LEVEL}"
            )));
        }
        if self.ttl_ms.is_some_and(|ttl| i64::try_from(ttl).is_err()) {
            return Err(RepoError::invalid_input("ttl exceeds supported range"));
        }
        Ok(())
    }

    /// Apply this payload on top of `existing`, or on top of defaults.
    pub fn apply(
        &self,
        existing: Option<&EndpointConfigRecord>,
        now: OffsetDateTime,
    ) -> EndpointConfigRecord {
        let base = existing.cloned().unwrap_or(EndpointConfigRecord {
            endpoint: self.endpoint.clone(),
            ttl_ms: DEFAULT_ENDPOINT_TTL_MS,
            enabled: true,
            compression_enabled: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            last_modified: now,
            access_count: 0,
        });

        EndpointConfigRecord {
            endpoint: self.endpoint.clone(),
            ttl_ms: self.ttl_ms.unwrap_or(base.ttl_ms),
            enabled: self.enabled.unwrap_or(base.enabled),
            compression_enabled: self.compression_enabled.unwrap_or(base.compression_enabled),
            compression_level: self.compression_level.unwrap_or(base.compression_level),
            last_modified: now,
            access_count: base.access_count,
        }
    }
}

/// Store of per-endpoint cache policies, keyed uniquely by endpoint path.
#[async_trait]
pub trait EndpointConfigRepo: Send + Sync {
    async fn find(&self, endpoint: &str) -> Result<Option<EndpointConfigRecord>, RepoError>;

    async fn list_all(&self) -> Result<Vec<EndpointConfigRecord>, RepoError>;

    async fn upsert(
        &self,
        upsert: EndpointConfigUpsert,
    ) -> Result<EndpointConfigRecord, RepoError>;

    /// Returns `false` when no record existed.
    async fn delete(&self, endpoint: &str) -> Result<bool, RepoError>;

    /// Bump `access_count`, creating the record with `default_ttl_ms` if absent.
    async fn increment_access(&self, endpoint: &str, default_ttl_ms: u64)
    -> Result<(), RepoError>;

    /// Enabled records ordered by descending access count.
    async fn top_enabled_by_access(
        &self,
        limit: usize,
    ) -> Result<Vec<EndpointConfigRecord>, RepoError>;

    async fn health_check(&self) -> Result<(), RepoError>;
}
