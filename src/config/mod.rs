//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{CliArgs, Command, DatabaseOverride, MigrateArgs, ServeArgs, ServeOverrides};

use crate::cache::DEFAULT_KEY_PREFIX;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "balcao";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_CACHE_TTL_MS: u64 = 300_000;
const DEFAULT_API_PREFIX: &str = "/api";
const DEFAULT_CAPTURE_BODY_LIMIT: u64 = 8 * 1024 * 1024;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_COMPRESSION_MIN_BYTES: u64 = 1024;
const DEFAULT_EVENT_BUFFER: u64 = 256;
const DEFAULT_REDIS_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_REDIS_RESPONSE_TIMEOUT_MS: u64 = 500;
const DEFAULT_REDIS_MAX_RETRIES: u32 = 5;
const DEFAULT_REDIS_BACKOFF_BASE_MS: u64 = 100;
const DEFAULT_REDIS_BACKOFF_MAX_MS: u64 = 5_000;
const DEFAULT_REDIS_PROBE_INTERVAL_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub distributed: DistributedSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// No URL means endpoint policies live in memory only.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub default_ttl_ms: u64,
    pub api_prefix: String,
    pub capture_body_limit: usize,
    pub sweep_interval_ms: u64,
    pub policy_cache_ttl_ms: u64,
    pub compression_min_bytes: usize,
    pub event_buffer: usize,
    pub flush_distributed_on_clear: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedSettings {
    /// No URL means the cache runs on the local tier only.
    pub url: Option<String>,
    pub key_prefix: String,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub probe_interval_ms: u64,
}

impl Default for DistributedSettings {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            connect_timeout_ms: DEFAULT_REDIS_CONNECT_TIMEOUT_MS,
            response_timeout_ms: DEFAULT_REDIS_RESPONSE_TIMEOUT_MS,
            max_retries: DEFAULT_REDIS_MAX_RETRIES,
            backoff_base_ms: DEFAULT_REDIS_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_REDIS_BACKOFF_MAX_MS,
            probe_interval_ms: DEFAULT_REDIS_PROBE_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("BALCAO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    distributed: RawDistributedSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.distributed.url = Some(url.clone());
        }
        if let Some(ttl) = overrides.cache_default_ttl_ms {
            self.cache.default_ttl_ms = Some(ttl);
        }
        if let Some(flush) = overrides.cache_flush_distributed_on_clear {
            self.cache.flush_distributed_on_clear = Some(flush);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            cache,
            distributed,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            cache: build_cache_settings(cache)?,
            distributed: build_distributed_settings(distributed)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;
    if public_addr == admin_addr {
        return Err(LoadError::invalid(
            "server.admin_port",
            "admin listener must not share the public address",
        ));
    }

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let api_prefix = cache
        .api_prefix
        .unwrap_or_else(|| DEFAULT_API_PREFIX.to_string());
    if !api_prefix.is_empty() && !api_prefix.starts_with('/') {
        return Err(LoadError::invalid(
            "cache.api_prefix",
            "must be empty or start with `/`",
        ));
    }

    let capture_body_limit = positive_usize(
        cache
            .capture_body_limit
            .unwrap_or(DEFAULT_CAPTURE_BODY_LIMIT),
        "cache.capture_body_limit",
    )?;
    let event_buffer = positive_usize(
        cache.event_buffer.unwrap_or(DEFAULT_EVENT_BUFFER),
        "cache.event_buffer",
    )?;
    let compression_min_bytes = usize::try_from(
        cache
            .compression_min_bytes
            .unwrap_or(DEFAULT_COMPRESSION_MIN_BYTES),
    )
    .map_err(|_| {
        LoadError::invalid(
            "cache.compression_min_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(CacheSettings {
        default_ttl_ms: cache.default_ttl_ms.unwrap_or(DEFAULT_CACHE_TTL_MS),
        api_prefix,
        capture_body_limit,
        sweep_interval_ms: cache.sweep_interval_ms.unwrap_or(DEFAULT_SWEEP_INTERVAL_MS),
        policy_cache_ttl_ms: cache.policy_cache_ttl_ms.unwrap_or(0),
        compression_min_bytes,
        event_buffer,
        flush_distributed_on_clear: cache.flush_distributed_on_clear.unwrap_or(false),
    })
}

fn build_distributed_settings(
    distributed: RawDistributedSettings,
) -> Result<DistributedSettings, LoadError> {
    let defaults = DistributedSettings::default();

    let key_prefix = distributed.key_prefix.unwrap_or(defaults.key_prefix);
    if key_prefix.is_empty() {
        return Err(LoadError::invalid(
            "distributed.key_prefix",
            "must not be empty; clearing would remove every key in the database",
        ));
    }

    let connect_timeout_ms = positive_u64(
        distributed
            .connect_timeout_ms
            .unwrap_or(defaults.connect_timeout_ms),
        "distributed.connect_timeout_ms",
    )?;
    let response_timeout_ms = positive_u64(
        distributed
            .response_timeout_ms
            .unwrap_or(defaults.response_timeout_ms),
        "distributed.response_timeout_ms",
    )?;
    let backoff_base_ms = positive_u64(
        distributed
            .backoff_base_ms
            .unwrap_or(defaults.backoff_base_ms),
        "distributed.backoff_base_ms",
    )?;
    let backoff_max_ms = distributed
        .backoff_max_ms
        .unwrap_or(defaults.backoff_max_ms);
    if backoff_max_ms < backoff_base_ms {
        return Err(LoadError::invalid(
            "distributed.backoff_max_ms",
            "must not be smaller than distributed.backoff_base_ms",
        ));
    }
    let probe_interval_ms = positive_u64(
        distributed
            .probe_interval_ms
            .unwrap_or(defaults.probe_interval_ms),
        "distributed.probe_interval_ms",
    )?;

    Ok(DistributedSettings {
        url: non_blank(distributed.url),
        key_prefix,
        connect_timeout_ms,
        response_timeout_ms,
        max_retries: distributed.max_retries.unwrap_or(defaults.max_retries),
        backoff_base_ms,
        backoff_max_ms,
        probe_interval_ms,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    default_ttl_ms: Option<u64>,
    api_prefix: Option<String>,
    capture_body_limit: Option<u64>,
    sweep_interval_ms: Option<u64>,
    policy_cache_ttl_ms: Option<u64>,
    compression_min_bytes: Option<u64>,
    event_buffer: Option<u64>,
    flush_distributed_on_clear: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDistributedSettings {
    url: Option<String>,
    key_prefix: Option<String>,
    connect_timeout_ms: Option<u64>,
    response_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    probe_interval_ms: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_u64(value: u64, key: &'static str) -> Result<u64, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn positive_usize(value: u64, key: &'static str) -> Result<usize, LoadError> {
    let value = positive_u64(value, key)?;
    usize::try_from(value)
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))
}
