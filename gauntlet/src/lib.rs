//! Gauntlet - hardware-flavor-aware test matrix orchestration.
//!
//! A crate for running a staged matrix of test commands against a pool
//! of heterogeneous hardware flavors, with capacity leasing, retries,
//! timeouts, and aggregated reporting.
//!
//! # Core Concepts
//!
//! - **Flavor**: A named class of hardware (for example `g2` or
//!   `g3.8xlarge`) with a concurrency capacity, declared in the
//!   [`FlavorCatalog`].
//!
//! - **Matrix**: The [`TestMatrix`] of sequential [`Stage`]s, each a set
//!   of concurrently-runnable [`Step`]s bound to flavors.
//!
//! - **Pool**: The [`FlavorPool`] hands out capacity [`Lease`]s per
//!   flavor, queueing waiters in arrival order.
//!
//! - **Executor**: The [`StepExecutor`] trait turns one step attempt
//!   into an [`ExecutionRecord`]; [`ProcessExecutor`] runs real
//!   commands in isolated process groups.
//!
//! - **Events**: The [`StepEventBus`] broadcasts progress events for
//!   live observers.
//!
//! - **Runtime**: The [`Runner`] ties pool, executor, and events
//!   together and produces the final [`RunReport`].
//!
//! # Example
//!
//! ```ignore
//! use gauntlet::*;
//! use std::sync::Arc;
//!
//! let catalog = FlavorCatalog::from_yaml(&flavors_yaml)?;
//! let matrix = TestMatrix::from_yaml(&matrix_yaml, &catalog)?;
//! let pool = Arc::new(FlavorPool::new(PoolConfig::from_catalog(&catalog)));
//!
//! let runner = RunnerBuilder::new(RunnerConfig::default())
//!     .with_pool(pool)
//!     .with_executor(Arc::new(ProcessExecutor::new()))
//!     .build()?;
//!
//! let report = runner.run(&matrix).await;
//! std::process::exit(report.exit_code());
//! ```

/// Error taxonomy for configuration and orchestration faults.
///
/// The `error` module provides [`ConfigError`], which aggregates every
/// validation violation in one report, and the top-level
/// [`GauntletError`].
pub mod error;

/// Hardware flavor catalog.
///
/// The `flavor` module defines [`FlavorId`], [`Flavor`], and the
/// [`FlavorCatalog`] parsed from the flavors YAML document.
pub mod flavor;

/// Test matrix definition and validation.
///
/// The `matrix` module defines the run plan:
/// - [`TestMatrix`] - ordered stages
/// - [`Stage`] - a named set of concurrent steps
/// - [`Step`] - one command bound to a flavor, with env overrides,
///   working directory, tensor-parallel degree, and software variant
pub mod matrix;

/// Capacity leases and retry policy.
///
/// The `lease` module provides [`Lease`] and [`LeaseId`] handed out by
/// the pool, plus [`RetryPolicy`] and the retry decision helpers.
pub mod lease;

/// Per-flavor capacity pool.
///
/// The `pool` module provides [`FlavorPool`], which grants at most
/// `capacity` concurrent leases per flavor and parks further requests
/// in arrival order, and its [`PoolConfig`].
pub mod pool;

/// Process-backed step execution.
///
/// The `executor` module provides [`ProcessExecutor`], which runs step
/// commands under `sh -c` in isolated process groups, and the bounded
/// [`OutputTail`] capture buffer.
pub mod executor;

/// Progress event broadcasting.
///
/// The `events` module provides [`StepEvent`] and the broadcast-backed
/// [`StepEventBus`] for live run observers.
pub mod events;

/// Result aggregation and report rendering.
///
/// The `report` module defines the outcome model:
/// - [`AttemptOutcome`] and [`Attempt`] - per-execution results
/// - [`StepReport`], [`StageReport`], [`RunReport`] - the aggregate
/// - JSON, JSON-lines, and human rendering plus process exit codes
pub mod report;

/// Tracing spans and structured log helpers.
pub mod telemetry;

/// Runtime orchestration of a matrix run.
///
/// The `runtime` module provides the [`Runner`] that drives stages in
/// order and steps concurrently under flavor leases. Includes:
/// - [`Runner`] - main runtime type
/// - [`RunnerConfig`] and [`FailurePolicy`] - run configuration
/// - [`ShutdownToken`] - graceful cancellation signaling
/// - [`StepExecutor`] - trait for step execution
/// - [`RunnerBuilder`] - dependency wiring
pub mod runtime;

pub use error::*;
pub use events::*;
pub use executor::*;
pub use flavor::*;
pub use lease::*;
pub use matrix::*;
pub use pool::*;
pub use report::*;
pub use runtime::*;
