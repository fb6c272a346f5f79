//! # Sync Engine Library
//!
//! Durable sync queue and cross-service orchestration: every business entity
//! change is queued, dispatched to the external services it must reach, retried
//! with backoff and logged, with health reporting on top.

pub mod adapters;
pub mod auth;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;
pub mod repositories;
pub mod retry;
pub mod server;
pub mod telemetry;
pub use migration;
