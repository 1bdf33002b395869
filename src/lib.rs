//! Hybrid NOTIFY + polling signal relay.
//!
//! Trading signals are pulled from a relational store, reconciled into an
//! ordered, deduplicated trailing window and fanned out to any number of
//! WebSocket subscribers, each with its own delivery cursor and bounded
//! outbound queue.

pub mod broadcast;
pub mod config;
pub mod core;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;

pub use error::{EngineError, Result};
