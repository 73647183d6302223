//! Event-driven scheduling and top-level run loop for a constellation.

pub mod orchestrator;
pub mod scheduler;

pub use orchestrator::{ConstellationOrchestrator, OrchestratorConfig, SessionDump};
pub use scheduler::ExecutionScheduler;
