//! genforge: sequential generation jobs with quality gating and autonomous healing.

pub mod channel;
pub mod client;
pub mod config;
pub mod errors;
pub mod healing;
pub mod jobs;
pub mod observer;
pub mod orchestrator;
pub mod pipeline;
pub mod process;
pub mod quality;
pub mod server;
pub mod telemetry;
