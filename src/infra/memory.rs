//! In-process endpoint configuration store.
//!
//! Used when no database is configured, and by tests. Contents are lost on
//! restart.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{
    EndpointConfigRecord, EndpointConfigRepo, EndpointConfigUpsert, RepoError,
};

#[derive(Default)]
pub struct MemoryConfigStore {
    records: RwLock<HashMap<String, EndpointConfigRecord>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<EndpointConfigRecord>) -> Self {
        Self {
            records: RwLock::new(
                records
                    .into_iter()
                    .map(|record| (record.endpoint.clone(), record))
                    .collect(),
            ),
        }
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, EndpointConfigRecord>>, RepoError>
    {
        self.records
            .read()
            .map_err(|_| RepoError::from_persistence("config store lock poisoned"))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, EndpointConfigRecord>>, RepoError>
    {
        self.records
            .write()
            .map_err(|_| RepoError::from_persistence("config store lock poisoned"))
    }
}

#[async_trait]
impl EndpointConfigRepo for MemoryConfigStore {
    async fn find(&self, endpoint: &str) -> Result<Option<EndpointConfigRecord>, RepoError> {
        Ok(self.read()?.get(endpoint).cloned())
    }

    async fn list_all(&self) -> Result<Vec<EndpointConfigRecord>, RepoError> {
        let mut records: Vec<_> = self.read()?.values().cloned().collect();
        records.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        Ok(records)
    }

    async fn upsert(&self, upsert: EndpointConfigUpsert) -> Result<EndpointConfigRecord, RepoError> {
        upsert.validate()?;
        let mut records = self.write()?;
        let record = upsert.apply(records.get(&upsert.endpoint), OffsetDateTime::now_utc());
        records.insert(record.endpoint.clone(), record.clone());
        Ok(record)
    }

    async fn delete(&self, endpoint: &str) -> Result<bool, RepoError> {
        Ok(self.write()?.remove(endpoint).is_some())
    }

    async fn increment_access(&self, endpoint: &str, default_ttl_ms: u64) -> Result<(), RepoError> {
        let mut records = self.write()?;
        match records.get_mut(endpoint) {
            Some(record) => record.access_count = record.access_count.saturating_add(1),
            None => {
                let record = EndpointConfigRecord::first_access(
                    endpoint,
                    default_ttl_ms,
                    OffsetDateTime::now_utc(),
                );
                records.insert(endpoint.to_string(), record);
            }
        }
        Ok(())
    }

    async fn top_enabled_by_access(
        &self,
        limit: usize,
    ) -> Result<Vec<EndpointConfigRecord>, RepoError> {
        let mut records: Vec<_> = self
            .read()?
            .values()
            .filter(|record| record.enabled)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| a.endpoint.cmp(&b.endpoint))
        });
        records.truncate(limit);
        Ok(records)
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        self.read().map(|_| ())
    }
}
