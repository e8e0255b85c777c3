//! Worker-side services: job tracking and the transcode pool

pub mod tracker;
pub mod worker;
