//! HTTP API exposed to the container orchestrator

pub mod health;
