pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod manifest;
pub mod orchestrator;
pub mod reboot;
pub mod report;
pub mod retry;
pub mod step;
pub mod transcript;
