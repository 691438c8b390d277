use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{
    DEFAULT_COMPRESSION_LEVEL, EndpointConfigRecord, EndpointConfigRepo, EndpointConfigUpsert,
    RepoError,
};

use super::{PostgresRepositories, map_sqlx_error};

const SELECT_COLUMNS: &str = "endpoint, ttl_ms, enabled, compression_enabled, \
    compression_level, last_modified, access_count";

#[derive(sqlx::FromRow)]
struct EndpointConfigRow {
    endpoint: String,
    ttl_ms: i64,
    enabled: bool,
    compression_enabled: bool,
    compression_level: i16,
    last_modified: OffsetDateTime,
    access_count: i64,
}

impl TryFrom<EndpointConfigRow> for EndpointConfigRecord {
    type Error = RepoError;

    fn try_from(row: EndpointConfigRow) -> Result<Self, Self::Error> {
        Ok(Self {
            endpoint: row.endpoint,
            ttl_ms: to_unsigned(row.ttl_ms, "ttl_ms")?,
            enabled: row.enabled,
            compression_enabled: row.compression_enabled,
            compression_level: u8::try_from(row.compression_level).map_err(|_| {
                RepoError::from_persistence("compression_level outside supported range")
            })?,
            last_modified: row.last_modified,
            access_count: to_unsigned(row.access_count, "access_count")?,
        })
    }
}

fn to_unsigned(value: i64, column: &str) -> Result<u64, RepoError> {
    u64::try_from(value)
        .map_err(|_| RepoError::from_persistence(format!("{column} is negative")))
}

fn to_signed(value: u64) -> Result<i64, RepoError> {
    i64::try_from(value).map_err(|_| RepoError::invalid_input("value exceeds supported range"))
}

fn convert_rows(rows: Vec<EndpointConfigRow>) -> Result<Vec<EndpointConfigRecord>, RepoError> {
    rows.into_iter().map(EndpointConfigRecord::try_from).collect()
}

#[async_trait]
impl EndpointConfigRepo for PostgresRepositories {
    async fn find(&self, endpoint: &str) -> Result<Option<EndpointConfigRecord>, RepoError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM endpoint_cache_configs WHERE endpoint = $1");
        let row = sqlx::query_as::<_, EndpointConfigRow>(&sql)
            .bind(endpoint)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(EndpointConfigRecord::try_from).transpose()
    }

    async fn list_all(&self) -> Result<Vec<EndpointConfigRecord>, RepoError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM endpoint_cache_configs ORDER BY endpoint");
        let rows = sqlx::query_as::<_, EndpointConfigRow>(&sql)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        convert_rows(rows)
    }

    async fn upsert(&self, upsert: EndpointConfigUpsert) -> Result<EndpointConfigRecord, RepoError> {
        upsert.validate()?;

        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let select = format!(
            "SELECT {SELECT_COLUMNS} FROM endpoint_cache_configs WHERE endpoint = $1 FOR UPDATE"
        );
        let existing = sqlx::query_as::<_, EndpointConfigRow>(&select)
            .bind(&upsert.endpoint)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .map(EndpointConfigRecord::try_from)
            .transpose()?;

        let record = upsert.apply(existing.as_ref(), OffsetDateTime::now_utc());

        let write = format!(
            r#"
            INSERT INTO endpoint_cache_configs
                (endpoint, ttl_ms, enabled, compression_enabled, compression_level, last_modified, access_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (endpoint) DO UPDATE SET
                ttl_ms = EXCLUDED.ttl_ms,
                enabled = EXCLUDED.enabled,
                compression_enabled = EXCLUDED.compression_enabled,
                compression_level = EXCLUDED.compression_level,
                last_modified = EXCLUDED.last_modified
            RETURNING {SELECT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, EndpointConfigRow>(&write)
            .bind(&record.endpoint)
            .bind(to_signed(record.ttl_ms)?)
            .bind(record.enabled)
            .bind(record.compression_enabled)
            .bind(i16::from(record.compression_level))
            .bind(record.last_modified)
            .bind(to_signed(record.access_count)?)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        EndpointConfigRecord::try_from(row)
    }

    async fn delete(&self, endpoint: &str) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM endpoint_cache_configs WHERE endpoint = $1")
            .bind(endpoint)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_access(&self, endpoint: &str, default_ttl_ms: u64) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO endpoint_cache_configs
                (endpoint, ttl_ms, enabled, compression_enabled, compression_level, last_modified, access_count)
            VALUES ($1, $2, TRUE, TRUE, $3, now(), 1)
            ON CONFLICT (endpoint) DO UPDATE SET
                access_count = endpoint_cache_configs.access_count + 1
            "#,
        )
        .bind(endpoint)
        .bind(to_signed(default_ttl_ms)?)
        .bind(i16::from(DEFAULT_COMPRESSION_LEVEL))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn top_enabled_by_access(
        &self,
        limit: usize,
    ) -> Result<Vec<EndpointConfigRecord>, RepoError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM endpoint_cache_configs \
             WHERE enabled ORDER BY access_count DESC, endpoint LIMIT $1"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, EndpointConfigRow>(&sql)
            .bind(limit)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        convert_rows(rows)
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        PostgresRepositories::health_check(self)
            .await
            .map_err(map_sqlx_error)
    }
}
