//! Balcao: a two-tier HTTP response cache for axum applications.
//!
//! The [`cache`] module holds the engine; [`infra`] provides the Postgres
//! policy store, the Redis tier, telemetry, and the HTTP surfaces used by the
//! `balcao` binary.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
