//! BuildSage Backend Library
//!
//! Exposes the live build-recommendation core for the server binary and
//! integration tests.

pub mod aggregator;
pub mod auth;
pub mod engine;
pub mod limiter;
pub mod models;
pub mod registry;
pub mod service;
pub mod significance;
