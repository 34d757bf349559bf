use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use sluice_protocol::{
    cluster::{RowSample, SniffKind},
    configuration::{ExecutionConfiguration, ExecutionResult, LogLevel},
    definition::{PipelineDefinition, StepDefinition},
    status::{LifecycleState, StepRuntimeStatus, StepState},
};
use tokio::{sync::watch, task::JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use super::{
    lifecycle::{Lifecycle, RunLog},
    lock,
};
use crate::{
    execution::{EngineError, Execution, PipelineExecution},
    log_store::LogStore,
    repository::RepositoryConnection,
};

/// Rows kept per step copy and direction for sniffing
const SNIFF_BUFFER_ROWS: usize = 100;

struct StepCopy {
    definition: StepDefinition,
    copy: u32,
    state: Mutex<StepState>,
    running: AtomicBool,
    rows_read: AtomicU64,
    rows_written: AtomicU64,
    errors: AtomicU64,
    input: Mutex<VecDeque<Value>>,
    output: Mutex<VecDeque<Value>>,
}

impl StepCopy {
    fn new(definition: StepDefinition, copy: u32) -> Self {
        Self {
            definition,
            copy,
            state: Mutex::new(StepState::Empty),
            running: AtomicBool::new(false),
            rows_read: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            input: Mutex::new(VecDeque::new()),
            output: Mutex::new(VecDeque::new()),
        }
    }

    fn set_state(&self, state: StepState) {
        *lock(&self.state) = state;
        self.running.store(
            matches!(state, StepState::Running | StepState::Paused | StepState::Halting),
            Ordering::Release,
        );
    }

    fn status(&self) -> StepRuntimeStatus {
        StepRuntimeStatus {
            step_name: self.definition.name.clone(),
            copy: self.copy,
            running: self.running.load(Ordering::Acquire),
            state: *lock(&self.state),
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn buffer(&self, kind: SniffKind) -> &Mutex<VecDeque<Value>> {
        match kind {
            SniffKind::Input => &self.input,
            SniffKind::Output => &self.output,
        }
    }

    fn record(&self, kind: SniffKind, row: Value) {
        let mut buffer = lock(self.buffer(kind));
        if buffer.len() == SNIFF_BUFFER_ROWS {
            buffer.pop_front();
        }
        buffer.push_back(row);
    }

    fn sample(&self, kind: SniffKind, lines: usize) -> Vec<Value> {
        let buffer = lock(self.buffer(kind));
        let skip = buffer.len().saturating_sub(lines);
        buffer.iter().skip(skip).cloned().collect()
    }

    fn limit_reached(&self) -> bool {
        self.definition
            .fail_after
            .is_some_and(|limit| self.rows_written.load(Ordering::Relaxed) >= limit)
    }
}

enum CopyOutcome {
    Completed,
    Stopped,
    Failed(String),
}

struct Shared {
    definition: PipelineDefinition,
    lifecycle: Lifecycle,
    copies: Vec<Arc<StepCopy>>,
    log: RunLog,
    configuration: Mutex<ExecutionConfiguration>,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    error: Mutex<Option<String>>,
    result: Mutex<Option<ExecutionResult>>,
    repository: Option<Arc<dyn RepositoryConnection>>,
    /// Serializes lifecycle operations on this object
    control: tokio::sync::Mutex<()>,
}

impl Shared {
    fn prepare(&self, configuration: &ExecutionConfiguration) -> Result<(), EngineError> {
        self.lifecycle.transition(LifecycleState::Preparing)?;

        *lock(&self.configuration) = configuration.clone();
        self.log.set_level(configuration.log_level);
        self.log.write(
            LogLevel::Basic,
            format!("Preparing pipeline '{}'", self.definition.name),
        );

        if let Some(repository) = &self.repository {
            self.log.write(
                LogLevel::Detailed,
                format!("Using repository '{}'", repository.name()),
            );
        }
        for (name, value) in &configuration.parameters {
            self.log
                .write(LogLevel::Detailed, format!("Parameter {name}={value}"));
        }
        if !configuration.arguments.is_empty() {
            self.log.write(
                LogLevel::Detailed,
                format!("Arguments: {}", configuration.arguments.join(" ")),
            );
        }
        if configuration.safe_mode {
            self.log.write(LogLevel::Basic, "Safe mode enabled");
        }
        if let Some(replay_date) = configuration.replay_date {
            self.log
                .write(LogLevel::Basic, format!("Replaying as of {replay_date}"));
        }

        self.lifecycle.transition(LifecycleState::Initialized)?;
        Ok(())
    }

    fn launch(shared: &Arc<Self>) {
        shared.log.write(
            LogLevel::Basic,
            format!(
                "Starting pipeline '{}' with {} step copies",
                shared.definition.name,
                shared.copies.len()
            ),
        );

        let copies: Vec<_> = shared
            .copies
            .iter()
            .map(|copy| {
                // running as soon as start returns, not once the task is polled
                copy.set_state(StepState::Running);
                let span = info_span!("step_copy", step = %copy.definition.name, copy = copy.copy);
                let shared = Arc::clone(shared);
                let copy = Arc::clone(copy);
                tokio::spawn(async move { shared.run_copy(&copy).await }.instrument(span))
            })
            .collect();

        let span = info_span!("pipeline", name = %shared.definition.name, log_channel = %shared.log.channel());
        let shared = Arc::clone(shared);
        tokio::spawn(
            async move {
                let outcomes = join_all(copies).await;
                shared.complete(outcomes).await;
            }
            .instrument(span),
        );
    }

    async fn run_copy(&self, copy: &StepCopy) -> CopyOutcome {
        let step = &copy.definition;
        let mut paused = self.paused.subscribe();
        let delay = Duration::from_millis(step.row_delay_ms);

        copy.set_state(StepState::Running);
        debug!("Step copy started");

        for row in 0..step.rows {
            self.hold_while_paused(copy, &mut paused).await;

            if self.cancel.is_cancelled() {
                return self.stop_copy(copy);
            }
            if copy.limit_reached() {
                return self.fail_copy(copy);
            }

            copy.record(SniffKind::Input, json!({ "row": row }));
            copy.rows_read.fetch_add(1, Ordering::Relaxed);

            copy.record(
                SniffKind::Output,
                json!({ "row": row, "step": step.name, "copy": copy.copy }),
            );
            copy.rows_written.fetch_add(1, Ordering::Relaxed);
            self.log.write(
                LogLevel::Rowlevel,
                format!("{}.{} - wrote row {row}", step.name, copy.copy),
            );

            if !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return self.stop_copy(copy),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        if copy.limit_reached() {
            return self.fail_copy(copy);
        }

        copy.set_state(StepState::Finished);
        self.log.write(
            LogLevel::Basic,
            format!(
                "{}.{} - Finished processing (I={}, O={})",
                step.name,
                copy.copy,
                copy.rows_read.load(Ordering::Relaxed),
                copy.rows_written.load(Ordering::Relaxed)
            ),
        );
        CopyOutcome::Completed
    }

    async fn hold_while_paused(&self, copy: &StepCopy, paused: &mut watch::Receiver<bool>) {
        let is_paused = *paused.borrow_and_update();
        if !is_paused {
            return;
        }

        copy.set_state(StepState::Paused);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = async { let _ = paused.wait_for(|paused| !*paused).await; } => {}
        }
        copy.set_state(StepState::Running);
    }

    fn stop_copy(&self, copy: &StepCopy) -> CopyOutcome {
        copy.set_state(StepState::Stopped);
        self.log.write(
            LogLevel::Basic,
            format!("{}.{} - Stopped", copy.definition.name, copy.copy),
        );
        CopyOutcome::Stopped
    }

    fn fail_copy(&self, copy: &StepCopy) -> CopyOutcome {
        let message = format!(
            "{}.{} failed after {} rows",
            copy.definition.name,
            copy.copy,
            copy.rows_written.load(Ordering::Relaxed)
        );
        copy.errors.fetch_add(1, Ordering::Relaxed);
        copy.set_state(StepState::Errored);
        self.log.write(LogLevel::Error, &message);
        CopyOutcome::Failed(message)
    }

    async fn complete(&self, outcomes: Vec<Result<CopyOutcome, JoinError>>) {
        let _control = self.control.lock().await;

        let mut failures = vec![];
        let mut crashed = None;
        for outcome in outcomes {
            match outcome {
                Ok(CopyOutcome::Completed) | Ok(CopyOutcome::Stopped) => {}
                Ok(CopyOutcome::Failed(message)) => failures.push(message),
                Err(e) => crashed = Some(format!("step copy crashed: {e}")),
            }
        }

        let final_state = if crashed.is_some() {
            LifecycleState::Errored
        } else if self.cancel.is_cancelled() {
            LifecycleState::Stopped
        } else if !failures.is_empty() {
            LifecycleState::FinishedWithErrors
        } else {
            LifecycleState::Finished
        };

        let statuses: Vec<_> = self.copies.iter().map(|copy| copy.status()).collect();
        let result = ExecutionResult {
            success: final_state == LifecycleState::Finished,
            errors: statuses.iter().map(|s| s.errors).sum(),
            rows_read: statuses.iter().map(|s| s.rows_read).sum(),
            rows_written: statuses.iter().map(|s| s.rows_written).sum(),
            exit_status: if final_state == LifecycleState::Finished {
                0
            } else {
                1
            },
        };

        let error = crashed.or_else(|| (!failures.is_empty()).then(|| failures.join("; ")));
        *lock(&self.error) = error;
        *lock(&self.result) = Some(result);

        // a pause that raced the last rows is lifted before finishing
        if self.lifecycle.current() == LifecycleState::Paused
            && matches!(
                final_state,
                LifecycleState::Finished | LifecycleState::FinishedWithErrors
            )
        {
            self.paused.send_replace(false);
            let _ = self.lifecycle.transition(LifecycleState::Running);
        }

        // observers of the terminal state see the closing line
        self.log.write(
            LogLevel::Minimal,
            format!("Pipeline '{}' ended: {final_state}", self.definition.name),
        );
        match self.lifecycle.transition(final_state) {
            Ok(_) => info!(state = %final_state, "Pipeline run ended"),
            Err(e) => error!(error = %e, "Failed to record pipeline completion"),
        }
    }
}

/// A pipeline running on the local tokio runtime
pub struct LocalPipeline {
    shared: Arc<Shared>,
}

impl LocalPipeline {
    pub(crate) fn new(
        definition: PipelineDefinition,
        configuration: ExecutionConfiguration,
        log_store: Arc<LogStore>,
        log_channel_id: String,
        repository: Option<Arc<dyn RepositoryConnection>>,
    ) -> Self {
        let copies = definition
            .steps
            .iter()
            .flat_map(|step| {
                (0..step.copies).map(move |copy| Arc::new(StepCopy::new(step.clone(), copy)))
            })
            .collect();
        let log = RunLog::new(log_store, log_channel_id, configuration.log_level);

        Self {
            shared: Arc::new(Shared {
                definition,
                lifecycle: Lifecycle::new(),
                copies,
                log,
                configuration: Mutex::new(configuration),
                cancel: CancellationToken::new(),
                paused: watch::Sender::new(false),
                error: Mutex::new(None),
                result: Mutex::new(None),
                repository,
                control: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

#[async_trait]
impl Execution for LocalPipeline {
    fn name(&self) -> &str {
        &self.shared.definition.name
    }

    fn log_channel_id(&self) -> &str {
        self.shared.log.channel()
    }

    fn state(&self) -> LifecycleState {
        self.shared.lifecycle.current()
    }

    fn error(&self) -> Option<String> {
        lock(&self.shared.error).clone()
    }

    fn result(&self) -> Option<ExecutionResult> {
        lock(&self.shared.result).clone()
    }

    async fn start(&self) -> Result<(), EngineError> {
        let _control = self.shared.control.lock().await;

        match self.shared.lifecycle.current() {
            LifecycleState::Waiting => {
                let configuration = lock(&self.shared.configuration).clone();
                self.shared.prepare(&configuration)?;
            }
            LifecycleState::Initialized => {}
            from => {
                return Err(EngineError::IllegalTransition {
                    from,
                    to: LifecycleState::Running,
                })
            }
        }

        self.shared.lifecycle.transition(LifecycleState::Running)?;
        Shared::launch(&self.shared);
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let _control = self.shared.control.lock().await;

        match self.shared.lifecycle.current() {
            LifecycleState::Running | LifecycleState::Paused => {
                self.shared.lifecycle.transition(LifecycleState::Halting)?;
                self.shared.cancel.cancel();
                self.shared.log.write(LogLevel::Basic, "Stopping all step copies");
            }
            LifecycleState::Waiting | LifecycleState::Preparing | LifecycleState::Initialized => {
                self.shared.lifecycle.transition(LifecycleState::Stopped)?;
                self.shared.log.write(LogLevel::Basic, "Stopped before running");
            }
            state => debug!(%state, "Stop requested for pipeline that is not running"),
        }
        Ok(())
    }

    fn completion(&self) -> watch::Receiver<LifecycleState> {
        self.shared.lifecycle.subscribe()
    }
}

#[async_trait]
impl PipelineExecution for LocalPipeline {
    async fn prepare(&self, configuration: &ExecutionConfiguration) -> Result<(), EngineError> {
        let _control = self.shared.control.lock().await;
        self.shared.prepare(configuration)
    }

    async fn pause(&self) -> Result<(), EngineError> {
        let _control = self.shared.control.lock().await;

        if self.shared.lifecycle.current() == LifecycleState::Paused {
            return Ok(());
        }
        self.shared.lifecycle.transition(LifecycleState::Paused)?;
        self.shared.paused.send_replace(true);
        self.shared.log.write(LogLevel::Basic, "Pipeline paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        let _control = self.shared.control.lock().await;

        if self.shared.lifecycle.current() == LifecycleState::Running {
            return Ok(());
        }
        self.shared.lifecycle.transition(LifecycleState::Running)?;
        self.shared.paused.send_replace(false);
        self.shared.log.write(LogLevel::Basic, "Pipeline resumed");
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), EngineError> {
        let _control = self.shared.control.lock().await;

        let state = self.shared.lifecycle.current();
        if state.is_active() {
            return Err(EngineError::InvalidState {
                operation: "clean up",
                state,
            });
        }

        for copy in &self.shared.copies {
            lock(&copy.input).clear();
            lock(&copy.output).clear();
        }
        self.shared.log.write(LogLevel::Detailed, "Released step resources");
        Ok(())
    }

    fn step_statuses(&self) -> Vec<StepRuntimeStatus> {
        self.shared.copies.iter().map(|copy| copy.status()).collect()
    }

    fn sniff(
        &self,
        step: &str,
        copy: u32,
        kind: SniffKind,
        lines: usize,
    ) -> Result<RowSample, EngineError> {
        let found = self
            .shared
            .copies
            .iter()
            .find(|c| c.definition.name == step && c.copy == copy)
            .ok_or_else(|| EngineError::StepNotFound {
                step: step.to_string(),
                copy,
            })?;

        Ok(RowSample {
            step_name: step.to_string(),
            copy,
            kind,
            rows: found.sample(kind, lines),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn pipeline(steps: Vec<StepDefinition>) -> (LocalPipeline, Arc<LogStore>) {
        let store = Arc::new(LogStore::new(1_000, None));
        let pipeline = LocalPipeline::new(
            PipelineDefinition::new("load".into(), steps),
            ExecutionConfiguration::default(),
            Arc::clone(&store),
            "load-log".into(),
            None,
        );
        (pipeline, store)
    }

    fn step(name: &str, rows: u64, row_delay_ms: u64) -> StepDefinition {
        StepDefinition {
            rows,
            row_delay_ms,
            ..StepDefinition::new(name.into())
        }
    }

    async fn wait_terminal(pipeline: &LocalPipeline) -> LifecycleState {
        let mut completion = pipeline.completion();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            completion.wait_for(|state| state.is_terminal()),
        )
        .await
        .expect("pipeline did not complete in time")
        .expect("pipeline dropped");
        *state
    }

    #[tokio::test]
    async fn runs_to_finished_and_counts_rows() {
        let (pipeline, store) = pipeline(vec![StepDefinition {
            copies: 2,
            ..step("read", 5, 0)
        }]);

        pipeline.start().await.unwrap();

        assert_eq!(wait_terminal(&pipeline).await, LifecycleState::Finished);
        let result = pipeline.result().unwrap();
        assert!(result.success);
        assert_eq!(result.rows_written, 10);
        assert_eq!(pipeline.error(), None);
        assert!(store.lines_from("load-log", 0).text().contains("Finished processing"));
    }

    #[tokio::test]
    async fn failing_copy_finishes_with_errors() {
        let (pipeline, _) = pipeline(vec![
            step("read", 3, 0),
            StepDefinition {
                fail_after: Some(1),
                ..step("write", 3, 0)
            },
        ]);

        pipeline.start().await.unwrap();

        assert_eq!(wait_terminal(&pipeline).await, LifecycleState::FinishedWithErrors);
        assert!(pipeline.error().unwrap().contains("write.0 failed after 1 rows"));
        assert_eq!(pipeline.result().unwrap().errors, 1);
    }

    #[tokio::test]
    async fn stop_halts_running_copies() {
        let (pipeline, _) = pipeline(vec![step("slow", 10_000, 10)]);
        pipeline.start().await.unwrap();

        pipeline.stop().await.unwrap();

        assert_eq!(wait_terminal(&pipeline).await, LifecycleState::Stopped);
        assert_eq!(pipeline.step_statuses()[0].state, StepState::Stopped);
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let (pipeline, _) = pipeline(vec![step("slow", 10_000, 5)]);
        pipeline.start().await.unwrap();

        pipeline.pause().await.unwrap();
        assert_eq!(pipeline.state(), LifecycleState::Paused);
        pipeline.pause().await.unwrap();

        pipeline.resume().await.unwrap();
        assert_eq!(pipeline.state(), LifecycleState::Running);

        pipeline.stop().await.unwrap();
        assert_eq!(wait_terminal(&pipeline).await, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn finished_pipeline_cannot_start_again() {
        let (pipeline, _) = pipeline(vec![step("read", 1, 0)]);
        pipeline.start().await.unwrap();
        wait_terminal(&pipeline).await;

        let error = pipeline.start().await.unwrap_err();

        assert!(matches!(
            error,
            EngineError::IllegalTransition {
                from: LifecycleState::Finished,
                to: LifecycleState::Running
            }
        ));
    }

    #[tokio::test]
    async fn prepare_then_start() {
        let (pipeline, store) = pipeline(vec![step("read", 1, 0)]);
        let configuration = ExecutionConfiguration {
            safe_mode: true,
            ..Default::default()
        };

        pipeline.prepare(&configuration).await.unwrap();
        assert_eq!(pipeline.state(), LifecycleState::Initialized);
        assert!(matches!(
            pipeline.prepare(&configuration).await,
            Err(EngineError::IllegalTransition { .. })
        ));

        pipeline.start().await.unwrap();
        wait_terminal(&pipeline).await;
        assert!(store.lines_from("load-log", 0).text().contains("Safe mode enabled"));
    }

    #[tokio::test]
    async fn sniff_returns_latest_rows() {
        let (pipeline, _) = pipeline(vec![step("read", 150, 0)]);
        pipeline.start().await.unwrap();
        wait_terminal(&pipeline).await;

        let sample = pipeline.sniff("read", 0, SniffKind::Output, 3).unwrap();

        let rows: Vec<u64> = sample.rows.iter().filter_map(|r| r["row"].as_u64()).collect();
        assert_eq!(rows, vec![147, 148, 149]);
        assert!(matches!(
            pipeline.sniff("read", 1, SniffKind::Output, 3),
            Err(EngineError::StepNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cleanup_is_refused_while_running() {
        let (pipeline, _) = pipeline(vec![step("slow", 10_000, 10)]);
        pipeline.start().await.unwrap();

        assert!(matches!(
            pipeline.cleanup().await,
            Err(EngineError::InvalidState { .. })
        ));

        pipeline.stop().await.unwrap();
        wait_terminal(&pipeline).await;
        pipeline.cleanup().await.unwrap();
        assert!(pipeline
            .sniff("slow", 0, SniffKind::Output, 10)
            .unwrap()
            .rows
            .is_empty());
    }
}
