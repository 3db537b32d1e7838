//! KVK alliance ingestion bot
//!
//! This library provides the core functionality for the kvk-ingest system:
//! per-channel upload queues feeding a globally serialized processing
//! pipeline, blocking-work offloads with an on-disk registry, and the
//! watchdog/singleton-lock protocol that keeps exactly one bot process alive.

pub mod app_state;
pub mod bot;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
