mod context;
mod executor;
mod orchestrator;
mod retry;

pub use context::{RunContext, SprintLog};
pub use executor::{execute_sprint, execute_with_deadline, ExecutionSettings, SprintOutcome};
pub use orchestrator::{RunOrchestrator, RunReport, RunState, COMMIT_FILE};
pub use retry::{backoff_delay, retry_with_backoff};
