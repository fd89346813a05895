pub mod engine;
pub mod outcome;

pub use engine::{Orchestrator, OrchestratorOptions};
pub use outcome::{EXIT_STORE_CORRUPT, FatalReason, RunOutcome, RunReport};
