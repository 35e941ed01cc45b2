use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::events::StepEventBus;
use crate::pool::FlavorPool;

use super::supervisor::{Runner, RunnerConfig, StepExecutor};

/// Builder for constructing a [`Runner`] with explicit dependencies.
///
/// The builder validates that all required dependencies are provided
/// before constructing the runner. Each dependency is configured via a
/// `with_*` method; the event bus is optional and defaults to one sized
/// from the runner config.
///
/// # Example
///
/// ```ignore
/// use gauntlet::*;
///
/// let runner = RunnerBuilder::new(config)
///     .with_pool(pool)
///     .with_executor(executor)
///     .build()?;
/// ```
pub struct RunnerBuilder<X>
where
    X: StepExecutor + 'static,
{
    config: RunnerConfig,
    pool: Option<Arc<FlavorPool>>,
    executor: Option<Arc<X>>,
    events: Option<Arc<StepEventBus>>,
}

impl<X> fmt::Debug for RunnerBuilder<X>
where
    X: StepExecutor + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RunnerBuilder");
        debug.field("config", &self.config);
        debug.field("pool_set", &self.pool.is_some());
        debug.field("executor_set", &self.executor.is_some());
        debug.field("events_set", &self.events.is_some());
        if self.executor.is_some() {
            debug.field("executor_type", &type_name::<X>());
        }
        debug.finish()
    }
}

impl<X> RunnerBuilder<X>
where
    X: StepExecutor + 'static,
{
    /// Create a new builder with the given runner configuration.
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            pool: None,
            executor: None,
            events: None,
        }
    }

    /// Set the flavor capacity pool.
    pub fn with_pool(mut self, pool: Arc<FlavorPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the step executor.
    pub fn with_executor(mut self, executor: Arc<X>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the progress event bus.
    pub fn with_events(mut self, events: Arc<StepEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the [`Runner`] with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<Runner<X>> {
        let pool = self
            .pool
            .ok_or_else(|| anyhow::anyhow!("pool dependency missing"))?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("executor dependency missing"))?;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(StepEventBus::new(self.config.event_capacity)));

        Ok(Runner::new(self.config, pool, executor, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ProcessExecutor;
    use crate::pool::PoolConfig;

    #[test]
    fn build_fails_without_pool() {
        let err = RunnerBuilder::<ProcessExecutor>::new(RunnerConfig::default())
            .with_executor(Arc::new(ProcessExecutor::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("pool"));
    }

    #[test]
    fn build_defaults_the_event_bus() {
        let config = RunnerConfig {
            event_capacity: 32,
            ..RunnerConfig::default()
        };
        let pool = Arc::new(FlavorPool::new(PoolConfig::new(Default::default())));
        let runner = RunnerBuilder::new(config)
            .with_pool(pool)
            .with_executor(Arc::new(ProcessExecutor::new()))
            .build()
            .unwrap();
        assert_eq!(runner.events().capacity(), 32);
    }
}
