//! HTTP surface: webhook ingestion, operator endpoints, process wiring.

pub mod app;
pub mod config;
