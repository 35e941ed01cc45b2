use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gauntlet::runtime::{ExecutionRecord, ShutdownToken, StepExecutor};
use gauntlet::{AttemptOutcome, FlavorId, Step};
use parking_lot::Mutex;

/// One recorded execution of a step attempt.
#[derive(Clone, Debug)]
pub struct Execution {
    pub step: String,
    pub flavor: FlavorId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

#[derive(Default)]
struct Inner {
    executions: Vec<Execution>,
    outcomes: HashMap<String, VecDeque<AttemptOutcome>>,
    delays: HashMap<String, Duration>,
    in_flight: HashMap<FlavorId, usize>,
    high_water: HashMap<FlavorId, usize>,
}

/// Scriptable executor that records every attempt without spawning
/// processes.
///
/// Outcomes are scripted per step name and consumed in order; once a
/// step's script is exhausted further attempts pass. An optional
/// per-step delay makes an attempt take wall-clock time, and a delayed
/// attempt observes the shutdown token and reports `Cancelled`. The
/// per-flavor in-flight high-water mark is tracked so tests can assert
/// that capacity limits were never exceeded.
#[derive(Clone, Default)]
pub struct MockExecutor {
    inner: Arc<Mutex<Inner>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next unscripted attempt of `step`.
    pub fn script_outcome(&self, step: &str, outcome: AttemptOutcome) {
        self.inner
            .lock()
            .outcomes
            .entry(step.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Make every attempt of `step` take `delay` of wall-clock time.
    pub fn set_delay(&self, step: &str, delay: Duration) {
        self.inner.lock().delays.insert(step.to_string(), delay);
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.inner.lock().executions.clone()
    }

    pub fn executions_for(&self, step: &str) -> Vec<Execution> {
        self.inner
            .lock()
            .executions
            .iter()
            .filter(|e| e.step == step)
            .cloned()
            .collect()
    }

    pub fn execution_count(&self) -> usize {
        self.inner.lock().executions.len()
    }

    /// Peak number of simultaneously executing attempts on `flavor`.
    pub fn high_water(&self, flavor: &str) -> usize {
        self.inner
            .lock()
            .high_water
            .get(&FlavorId::from(flavor))
            .copied()
            .unwrap_or(0)
    }

    pub fn assert_execution_count_eq(&self, expected: usize) {
        let actual = self.execution_count();
        assert_eq!(
            actual, expected,
            "Expected {} executions, got {}",
            expected, actual
        );
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.executions.clear();
        inner.high_water.clear();
    }
}

#[async_trait]
impl StepExecutor for MockExecutor {
    async fn execute(
        &self,
        step: &Step,
        _timeout: Duration,
        shutdown: &ShutdownToken,
    ) -> ExecutionRecord {
        let (delay, scripted) = {
            let mut inner = self.inner.lock();
            let current = inner.in_flight.entry(step.flavor.clone()).or_insert(0);
            *current += 1;
            let current = *current;
            let high = inner.high_water.entry(step.flavor.clone()).or_insert(0);
            if current > *high {
                *high = current;
            }
            let delay = inner.delays.get(&step.name).copied();
            let scripted = inner
                .outcomes
                .get_mut(&step.name)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(AttemptOutcome::Passed);
            (delay, scripted)
        };

        let started_at = Utc::now();
        let mut outcome = scripted;
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {
                    outcome = AttemptOutcome::Cancelled;
                }
            }
        }
        let finished_at = Utc::now();

        {
            let mut inner = self.inner.lock();
            if let Some(count) = inner.in_flight.get_mut(&step.flavor) {
                *count = count.saturating_sub(1);
            }
            inner.executions.push(Execution {
                step: step.name.clone(),
                flavor: step.flavor.clone(),
                started_at,
                finished_at,
                outcome: outcome.clone(),
            });
        }

        ExecutionRecord {
            outcome,
            output_tail: Vec::new(),
        }
    }
}
