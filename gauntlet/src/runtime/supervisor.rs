use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::Instrument;
use uuid::Uuid;

use crate::events::{EventMeta, StepEvent, StepEventBus};
use crate::lease::{outcome_retryable, should_retry, RetryPolicy};
use crate::matrix::{Stage, Step, TestMatrix};
use crate::pool::FlavorPool;
use crate::report::{
    Attempt, AttemptOutcome, RunReport, StageReport, StageStatus, StepReport, StepStatus,
};
use crate::telemetry;

/// What the runner does with stages that follow a failed one.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FailurePolicy {
    /// Later stages are skipped once a stage fails.
    #[default]
    StopOnFailure,
    /// Every stage runs regardless of earlier failures.
    ContinueOnFailure,
}

/// Configuration for the matrix runner.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Retry budget applied to every step.
    pub retry: RetryPolicy,
    /// Whether a failed stage halts the rest of the run.
    pub failure_policy: FailurePolicy,
    /// Wall-clock limit for a single attempt of a step's command.
    pub step_timeout: Duration,
    /// Broadcast buffer size for the progress event bus.
    pub event_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            step_timeout: Duration::from_secs(3600),
            event_capacity: 256,
        }
    }
}

/// Token for signaling graceful shutdown to in-flight step workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    ///
    /// The waiter is registered before the flag is re-checked, so a
    /// `cancel` landing between the two cannot be missed.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one execution attempt, as reported by an executor.
#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub outcome: AttemptOutcome,
    /// Bounded tail of the attempt's combined output.
    pub output_tail: Vec<String>,
}

/// Trait for executing a single attempt of a step's command.
///
/// The runner owns leasing, retries, and bookkeeping; the executor only
/// turns one `Step` into one `ExecutionRecord`. An executor must honor
/// `timeout` and `shutdown` by yielding `TimedOut` / `Cancelled`, and
/// must report infrastructure faults as `ExecError` rather than
/// panicking.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute one attempt of `step`.
    async fn execute(
        &self,
        step: &Step,
        timeout: Duration,
        shutdown: &ShutdownToken,
    ) -> ExecutionRecord;
}

/// Drives a test matrix to completion: stages strictly in order, steps
/// within a stage concurrently, each step gated on a capacity lease for
/// its hardware flavor.
pub struct Runner<X>
where
    X: StepExecutor + 'static,
{
    config: RunnerConfig,
    pool: Arc<FlavorPool>,
    executor: Arc<X>,
    events: Arc<StepEventBus>,
    shutdown: ShutdownToken,
}

impl<X> fmt::Debug for Runner<X>
where
    X: StepExecutor + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("executor_type", &type_name::<X>())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<X> Runner<X>
where
    X: StepExecutor + 'static,
{
    pub fn new(
        config: RunnerConfig,
        pool: Arc<FlavorPool>,
        executor: Arc<X>,
        events: Arc<StepEventBus>,
    ) -> Self {
        Self {
            config,
            pool,
            executor,
            events,
            shutdown: ShutdownToken::new(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn pool(&self) -> Arc<FlavorPool> {
        Arc::clone(&self.pool)
    }

    pub fn events(&self) -> Arc<StepEventBus> {
        Arc::clone(&self.events)
    }

    /// Token shared with signal handlers; cancelling it aborts the run.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Run the matrix to completion and return the aggregated report.
    ///
    /// Stages run strictly in matrix order. A failed or
    /// resource-unavailable stage halts the rest of the run under
    /// `StopOnFailure`; skipped stages still appear in the report. Cancellation is observed between stages
    /// and inside every in-flight step.
    pub async fn run(&self, matrix: &TestMatrix) -> RunReport {
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let run_start = Instant::now();

        let mut stage_reports = Vec::with_capacity(matrix.stages.len());
        let mut halted = false;
        for stage in &matrix.stages {
            if halted || self.shutdown.is_cancelled() {
                let steps = stage
                    .steps
                    .iter()
                    .map(|s| StepReport::skipped(&stage.name, &s.name, s.flavor.to_string()))
                    .collect();
                stage_reports.push(StageReport::skipped(&stage.name, steps));
                continue;
            }

            let report = self
                .run_stage(stage)
                .instrument(telemetry::stage_span(&stage.name))
                .await;
            if matches!(
                report.status,
                StageStatus::Failed | StageStatus::ResourceUnavailable
            ) && self.config.failure_policy == FailurePolicy::StopOnFailure
            {
                tracing::warn!(
                    stage = %stage.name,
                    status = %report.status,
                    "stage did not pass, halting remaining stages"
                );
                halted = true;
            }
            stage_reports.push(report);
        }

        let cancelled = self.shutdown.is_cancelled();
        let report = RunReport::finalize(run_id, started_at, stage_reports, cancelled);
        self.events.publish(StepEvent::RunFinished {
            meta: EventMeta::now(),
            status: report.status,
        });
        telemetry::record_run_finished(report.status.to_string(), run_start.elapsed().as_secs_f64());
        report
    }

    /// Run one stage: spawn a worker per admissible step, join them
    /// all, then finalize the verdict. Steps whose flavor has no
    /// configured capacity can never lease and are skipped up front; a
    /// stage where no step is admissible fails fast without spawning.
    async fn run_stage(&self, stage: &Stage) -> StageReport {
        let stage_start = Instant::now();
        self.events.publish(StepEvent::StageStarted {
            meta: EventMeta::now(),
            stage: stage.name.clone(),
        });

        let mut slots: Vec<Option<StepReport>> = vec![None; stage.steps.len()];
        let mut had_inadmissible = false;
        let mut admissible = Vec::new();
        for (idx, step) in stage.steps.iter().enumerate() {
            if self.pool.capacity(&step.flavor) == 0 {
                tracing::warn!(
                    stage = %stage.name,
                    step = %step.name,
                    flavor = %step.flavor,
                    "no capacity configured for flavor, skipping step"
                );
                had_inadmissible = true;
                slots[idx] =
                    Some(StepReport::skipped(&stage.name, &step.name, step.flavor.to_string()));
            } else {
                admissible.push((idx, step.clone()));
            }
        }

        if admissible.is_empty() {
            let steps = slots.into_iter().flatten().collect();
            let report = StageReport::finalize(
                &stage.name,
                steps,
                had_inadmissible,
                stage_start.elapsed().as_millis() as u64,
            );
            self.finish_stage(&report);
            return report;
        }

        let mut handles = Vec::with_capacity(admissible.len());
        for (idx, step) in admissible {
            let config = self.config.clone();
            let pool = Arc::clone(&self.pool);
            let executor = Arc::clone(&self.executor);
            let events = Arc::clone(&self.events);
            let shutdown = self.shutdown.clone();
            let stage_name = stage.name.clone();
            let step_name = step.name.clone();
            let flavor = step.flavor.to_string();
            let handle = tokio::spawn(async move {
                Self::step_worker(config, pool, executor, events, shutdown, stage_name, step).await
            });
            handles.push((idx, step_name, flavor, handle));
        }

        for (idx, step_name, flavor, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(err) => {
                    tracing::error!(step = %step_name, "step worker panicked: {err}");
                    StepReport::finalize(
                        &stage.name,
                        &step_name,
                        flavor,
                        StepStatus::Failed,
                        Vec::new(),
                    )
                }
            };
            slots[idx] = Some(report);
        }

        let steps = slots.into_iter().flatten().collect();
        let report = StageReport::finalize(
            &stage.name,
            steps,
            had_inadmissible,
            stage_start.elapsed().as_millis() as u64,
        );
        self.finish_stage(&report);
        report
    }

    fn finish_stage(&self, report: &StageReport) {
        self.events.publish(StepEvent::StageFinished {
            meta: EventMeta::now(),
            stage: report.name.clone(),
            status: report.status,
        });
        telemetry::record_stage_finished(&report.name, report.status.to_string());
    }

    /// Drive one step through lease, execution, and retries until it
    /// reaches a terminal status. The lease is held only for the
    /// duration of an attempt and is released before retry scheduling,
    /// so a retrying step re-queues behind other waiters instead of
    /// pinning capacity.
    async fn step_worker(
        config: RunnerConfig,
        pool: Arc<FlavorPool>,
        executor: Arc<X>,
        events: Arc<StepEventBus>,
        shutdown: ShutdownToken,
        stage_name: String,
        step: Step,
    ) -> StepReport {
        let mut attempts: Vec<Attempt> = Vec::new();

        let status = loop {
            if shutdown.is_cancelled() {
                break StepStatus::Cancelled;
            }

            let lease = tokio::select! {
                result = pool
                    .acquire(&step.flavor)
                    .instrument(telemetry::lease_acquire_span(&step.name, step.flavor.to_string())) =>
                {
                    match result {
                        Ok(lease) => lease,
                        Err(err) => {
                            tracing::error!(step = %step.name, flavor = %step.flavor, "lease acquire failed: {err}");
                            let now = Utc::now();
                            attempts.push(Attempt {
                                number: attempts.len() as u16 + 1,
                                started_at: now,
                                finished_at: now,
                                outcome: AttemptOutcome::ExecError {
                                    message: format!("lease acquire failed: {err}"),
                                },
                                output_tail: Vec::new(),
                            });
                            break StepStatus::Failed;
                        }
                    }
                }
                _ = shutdown.cancelled() => break StepStatus::Cancelled,
            };

            let number = attempts.len() as u16 + 1;
            events.publish(StepEvent::StepStarted {
                meta: EventMeta::now(),
                stage: stage_name.clone(),
                step: step.name.clone(),
                flavor: step.flavor.to_string(),
                attempt: number,
            });

            let started_at = Utc::now();
            let record = telemetry::instrument_dispatch(
                &stage_name,
                &step.name,
                step.flavor.to_string(),
                number,
                executor.execute(&step, config.step_timeout, &shutdown),
            )
            .await;
            let finished_at = Utc::now();

            // Release before retry decisions so waiters are not starved
            // by a flapping step.
            pool.release(&lease).await;

            events.publish(StepEvent::AttemptFinished {
                meta: EventMeta::now(),
                stage: stage_name.clone(),
                step: step.name.clone(),
                attempt: number,
                outcome: record.outcome.clone(),
            });
            attempts.push(Attempt {
                number,
                started_at,
                finished_at,
                outcome: record.outcome.clone(),
                output_tail: record.output_tail,
            });

            match &record.outcome {
                AttemptOutcome::Passed => break StepStatus::Passed,
                AttemptOutcome::Cancelled => break StepStatus::Cancelled,
                outcome => {
                    if outcome_retryable(outcome)
                        && should_retry(attempts.len() as u16, &config.retry)
                        && !shutdown.is_cancelled()
                    {
                        tracing::info!(
                            step = %step.name,
                            attempt = number,
                            outcome = %outcome,
                            "retrying step"
                        );
                        continue;
                    }
                    break match outcome {
                        AttemptOutcome::TimedOut => StepStatus::TimedOut,
                        _ => StepStatus::Failed,
                    };
                }
            }
        };

        events.publish(StepEvent::StepFinished {
            meta: EventMeta::now(),
            stage: stage_name.clone(),
            step: step.name.clone(),
            status,
            attempts: attempts.len() as u16,
        });
        let report = StepReport::finalize(
            &stage_name,
            &step.name,
            step.flavor.to_string(),
            status,
            attempts,
        );
        telemetry::record_step_finished(
            &stage_name,
            &step.name,
            report.status.to_string(),
            report.attempt_count(),
            report.duration_ms as f64 / 1000.0,
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    use crate::flavor::FlavorId;
    use crate::pool::PoolConfig;
    use crate::report::RunStatus;

    fn step(name: &str, flavor: &str) -> Step {
        Step {
            name: name.to_string(),
            flavor: FlavorId::from(flavor),
            command: "true".to_string(),
            tp_degree: None,
            env: BTreeMap::new(),
            working_dir: None,
            variant: None,
        }
    }

    fn matrix(stages: Vec<(&str, Vec<Step>)>) -> TestMatrix {
        TestMatrix {
            stages: stages
                .into_iter()
                .map(|(name, steps)| Stage {
                    name: name.to_string(),
                    steps,
                })
                .collect(),
        }
    }

    fn pool(capacities: &[(&str, usize)]) -> Arc<FlavorPool> {
        let map: HashMap<FlavorId, usize> = capacities
            .iter()
            .map(|(name, cap)| (FlavorId::from(*name), *cap))
            .collect();
        Arc::new(FlavorPool::new(PoolConfig::new(map)))
    }

    /// Scriptable in-process executor: fails the named step for its
    /// first `failures` attempts, passes everything else.
    struct ScriptedExecutor {
        failing_step: String,
        failures: usize,
        seen: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn passing() -> Self {
            Self {
                failing_step: String::new(),
                failures: 0,
                seen: AtomicUsize::new(0),
            }
        }

        fn failing(step: &str, failures: usize) -> Self {
            Self {
                failing_step: step.to_string(),
                failures,
                seen: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            step: &Step,
            _timeout: Duration,
            _shutdown: &ShutdownToken,
        ) -> ExecutionRecord {
            let outcome = if step.name == self.failing_step
                && self.seen.fetch_add(1, Ordering::SeqCst) < self.failures
            {
                AttemptOutcome::Failed { exit_code: 1 }
            } else {
                AttemptOutcome::Passed
            };
            ExecutionRecord {
                outcome,
                output_tail: Vec::new(),
            }
        }
    }

    fn runner(config: RunnerConfig, pool: Arc<FlavorPool>, executor: ScriptedExecutor) -> Runner<ScriptedExecutor> {
        Runner::new(
            config,
            pool,
            Arc::new(executor),
            Arc::new(StepEventBus::default()),
        )
    }

    #[tokio::test]
    async fn passing_matrix_yields_exit_zero() {
        let r = runner(
            RunnerConfig::default(),
            pool(&[("g2", 2)]),
            ScriptedExecutor::passing(),
        );
        let m = matrix(vec![
            ("build", vec![step("compile", "g2")]),
            ("test", vec![step("unit", "g2"), step("smoke", "g2")]),
        ]);
        let report = r.run(&m).await;
        assert_eq!(report.status, RunStatus::Passed);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.step_records().count(), 3);
    }

    #[tokio::test]
    async fn failed_stage_skips_the_rest_under_stop_on_failure() {
        let r = runner(
            RunnerConfig::default(),
            pool(&[("g2", 1)]),
            ScriptedExecutor::failing("unit", usize::MAX),
        );
        let m = matrix(vec![
            ("test", vec![step("unit", "g2")]),
            ("perf", vec![step("bench", "g2")]),
        ]);
        let report = r.run(&m).await;
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.stages[0].status, StageStatus::Failed);
        assert_eq!(report.stages[1].status, StageStatus::Skipped);
        assert_eq!(report.stages[1].steps[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn continue_on_failure_runs_every_stage() {
        let config = RunnerConfig {
            failure_policy: FailurePolicy::ContinueOnFailure,
            ..RunnerConfig::default()
        };
        let r = runner(
            config,
            pool(&[("g2", 1)]),
            ScriptedExecutor::failing("unit", usize::MAX),
        );
        let m = matrix(vec![
            ("test", vec![step("unit", "g2")]),
            ("perf", vec![step("bench", "g2")]),
        ]);
        let report = r.run(&m).await;
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.stages[1].status, StageStatus::Passed);
    }

    #[tokio::test]
    async fn failing_attempt_is_retried_within_budget() {
        let config = RunnerConfig {
            retry: RetryPolicy::new(3),
            ..RunnerConfig::default()
        };
        let r = runner(
            config,
            pool(&[("g2", 1)]),
            ScriptedExecutor::failing("flaky", 2),
        );
        let m = matrix(vec![("test", vec![step("flaky", "g2")])]);
        let report = r.run(&m).await;
        assert_eq!(report.status, RunStatus::Passed);
        let record = report.step_records().next().unwrap();
        assert_eq!(record.attempt_count(), 3);
        assert_eq!(record.attempts[2].outcome, AttemptOutcome::Passed);
    }

    #[tokio::test]
    async fn all_inadmissible_stage_fails_fast_without_executing() {
        let r = runner(
            RunnerConfig::default(),
            pool(&[("g2", 1)]),
            ScriptedExecutor::passing(),
        );
        let m = matrix(vec![("perf", vec![step("bench", "g3.8xlarge")])]);
        let report = timeout(Duration::from_secs(5), r.run(&m))
            .await
            .expect("fail-fast stage should not block");
        assert_eq!(report.stages[0].status, StageStatus::ResourceUnavailable);
        assert_eq!(report.status, RunStatus::ResourceUnavailable);
        assert_eq!(report.exit_code(), 3);
        assert_eq!(r.executor.seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resource_unavailable_stage_halts_under_stop_on_failure() {
        let r = runner(
            RunnerConfig::default(),
            pool(&[("g2", 1)]),
            ScriptedExecutor::passing(),
        );
        let m = matrix(vec![
            ("gate", vec![step("bench", "g3.8xlarge")]),
            ("expensive", vec![step("soak", "g2")]),
        ]);
        let report = r.run(&m).await;
        assert_eq!(report.stages[0].status, StageStatus::ResourceUnavailable);
        assert_eq!(report.stages[1].status, StageStatus::Skipped);
        assert_eq!(report.stages[1].steps[0].status, StepStatus::Skipped);
        assert_eq!(report.status, RunStatus::ResourceUnavailable);
        assert_eq!(r.executor.seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resource_unavailable_stage_does_not_halt_under_continue() {
        let config = RunnerConfig {
            failure_policy: FailurePolicy::ContinueOnFailure,
            ..RunnerConfig::default()
        };
        let r = runner(config, pool(&[("g2", 1)]), ScriptedExecutor::passing());
        let m = matrix(vec![
            ("gate", vec![step("bench", "g3.8xlarge")]),
            ("expensive", vec![step("soak", "g2")]),
        ]);
        let report = r.run(&m).await;
        assert_eq!(report.stages[0].status, StageStatus::ResourceUnavailable);
        assert_eq!(report.stages[1].status, StageStatus::Passed);
        assert_eq!(r.executor.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partially_inadmissible_stage_runs_what_it_can() {
        let r = runner(
            RunnerConfig::default(),
            pool(&[("g2", 1)]),
            ScriptedExecutor::passing(),
        );
        let m = matrix(vec![(
            "test",
            vec![step("unit", "g2"), step("bench", "g3.8xlarge")],
        )]);
        let report = r.run(&m).await;
        assert_eq!(report.stages[0].status, StageStatus::ResourceUnavailable);
        assert_eq!(report.stages[0].steps[0].status, StepStatus::Passed);
        assert_eq!(report.stages[0].steps[1].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());

        // cancelled() should return immediately (not hang)
        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();
        let clone3 = token.clone();

        let h1 = tokio::spawn(async move { clone1.cancelled().await });
        let h2 = tokio::spawn(async move { clone2.cancelled().await });
        let h3 = tokio::spawn(async move { clone3.cancelled().await });

        tokio::time::sleep(Duration::from_millis(50)).await;

        token.cancel();

        let results = timeout(
            Duration::from_secs(5),
            futures::future::join_all(vec![h1, h2, h3]),
        )
        .await
        .expect("workers did not observe cancellation within 5 seconds");

        for r in results {
            r.expect("worker task panicked");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_cancel_is_never_missed() {
        // Race cancel() against freshly-started waiters: a waiter that
        // reads the flag before cancel but registers after must still
        // wake, or this hangs on the timeout.
        for _ in 0..200 {
            let token = ShutdownToken::new();
            let waiter = token.clone();
            let handle = tokio::spawn(async move { waiter.cancelled().await });
            token.cancel();
            timeout(Duration::from_secs(1), handle)
                .await
                .expect("waiter did not observe cancellation")
                .expect("waiter task panicked");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        let token = ShutdownToken::default();
        assert!(!token.is_cancelled());
    }
}
