/// Runtime builder for constructing runner instances.
pub mod builder;
/// Runtime supervisor driving stages, leases, and step workers.
pub mod supervisor;

pub use builder::RunnerBuilder;
pub use supervisor::{
    ExecutionRecord, FailurePolicy, Runner, RunnerConfig, ShutdownToken, StepExecutor,
};
