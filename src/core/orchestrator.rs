use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use dashmap::DashMap;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    constants::{
        CANCELLED_MSG, EVENTS_CHANNEL_CAPACITY, INTERNAL_FAILURE_MSG, MISSING_ARTIFACT_MSG,
        READ_CHAR_UNSUPPORTED_MSG, READ_CHAR_UNSUPPORTED_TYPE,
    },
    core::{
        cancel::{CancelReason, RunCancellation},
        console::{Console, ConsoleInterrupt},
        domain::{
            CompileRequest, Diagnostic, ExceptionInfo, LimitKind, RunOptions, RunOutcome,
            RunResult, RunStats,
        },
        events::{ExecutionSignals, LifecycleEvent, Phase},
        monitor::{MonitorLimits, ResourceMonitor},
        sandbox::{Capabilities, SandboxContext, TeardownReport},
        traits::{
            probe::ResourceProbe,
            runtime::{CompileError, ExecuteError, Runtime},
        },
    },
};

/// How long a cancelled execution unit gets to unwind before it is aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Runs untrusted code snippets, one sandbox per run.
#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    runtime: Arc<dyn Runtime>,
    probe: Arc<dyn ResourceProbe>,
    events: broadcast::Sender<LifecycleEvent>,
    active: Arc<DashMap<Uuid, Arc<RunCancellation>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn Runtime>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            runtime,
            probe,
            events,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Cancels a run in flight. Returns false when no such run is active.
    pub fn abandon(&self, run_id: Uuid) -> bool {
        match self.active.get(&run_id) {
            Some(cancellation) => {
                tracing::info!(%run_id, "run abandoned by caller");
                cancellation.trip(CancelReason::Abandoned);
                true
            }
            None => false,
        }
    }

    pub async fn run(&self, options: RunOptions) -> RunResult {
        self.run_with_id(Uuid::new_v4(), options).await
    }

    /// Runs `options` to completion. Never fails: every problem is reported in the result.
    ///
    /// Dropping the returned future abandons the run, teardown still happens.
    pub async fn run_with_id(&self, run_id: Uuid, options: RunOptions) -> RunResult {
        let run_at = Utc::now();

        let code_size = options.code_size();
        if code_size > self.config.code_size_limit_chars {
            tracing::info!(%run_id, code_size, "code size limit exceeded, not compiling");
            return RunResult {
                run_id,
                outcome: RunOutcome::limit(LimitKind::CodeSize),
                console_output: String::new(),
                stats: RunStats {
                    run_at,
                    ..RunStats::default()
                },
                teardown_warning: None,
                background_processes_alive: false,
            };
        }

        let cancellation = Arc::new(RunCancellation::new());
        self.active.insert(run_id, cancellation.clone());
        let guard = AbandonOnDrop(Some(cancellation.clone()));

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let result = engine
                .orchestrate(run_id, options, cancellation, run_at)
                .await;
            engine.active.remove(&run_id);
            result
        });

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(%run_id, "run task failed: {}", e);
                self.active.remove(&run_id);
                RunResult {
                    run_id,
                    outcome: RunOutcome::fatal(format!("{}: {}", INTERNAL_FAILURE_MSG, e)),
                    console_output: String::new(),
                    stats: RunStats {
                        run_at,
                        ..RunStats::default()
                    },
                    teardown_warning: None,
                    background_processes_alive: false,
                }
            }
        };
        guard.disarm();
        result
    }

    #[tracing::instrument(skip_all, fields(%run_id, language = ?options.language, kind = ?options.project_kind))]
    async fn orchestrate(
        &self,
        run_id: Uuid,
        options: RunOptions,
        cancellation: Arc<RunCancellation>,
        run_at: chrono::DateTime<Utc>,
    ) -> RunResult {
        let run_started = Instant::now();
        let stats = RunStats {
            run_at,
            ..RunStats::default()
        };

        let sandbox = match SandboxContext::create(
            run_id,
            self.config.scratch_dir(run_id),
            Capabilities::for_config(&self.config),
            self.config.cgroup_root.as_deref(),
        )
        .await
        {
            Ok(sandbox) => Arc::new(sandbox),
            Err(e) => {
                tracing::error!("failed to create sandbox: {}", e);
                return RunResult {
                    run_id,
                    outcome: RunOutcome::fatal(format!("{}: {}", INTERNAL_FAILURE_MSG, e)),
                    console_output: String::new(),
                    stats,
                    teardown_warning: None,
                    background_processes_alive: false,
                };
            }
        };

        let console = Console::new(
            self.config.output_limit_chars,
            options.console_input.clone(),
        );
        let signals = ExecutionSignals::new(run_id, self.events.clone());

        let monitor = ResourceMonitor::new(
            MonitorLimits::from_config(&self.config),
            self.probe.clone(),
            sandbox.clone(),
            signals.subscribe_phase(),
            cancellation.clone(),
        );
        let usage = monitor.usage();
        let monitor_stop = CancellationToken::new();
        let monitor_handle = monitor.spawn(monitor_stop.clone());

        let unit = ExecutionUnit {
            runtime: self.runtime.clone(),
            probe: self.probe.clone(),
            sandbox: sandbox.clone(),
            console: console.clone(),
            signals: signals.clone(),
            cancellation: cancellation.clone(),
            request: options.compile_request(),
        };
        let execution = tokio::spawn(unit.run());

        let outcome = self
            .await_execution(execution, signals.subscribe_phase(), &cancellation)
            .await;

        monitor_stop.cancel();
        if let Err(e) = monitor_handle.await {
            tracing::warn!("monitor task failed: {}", e);
        }

        let finished = Instant::now();
        let report: TeardownReport = sandbox.destroy().await;

        let stats = match signals.phase() {
            Phase::Compiling => RunStats {
                compile_time_ms: millis(finished - run_started),
                ..stats
            },
            Phase::Executing { started, .. } => RunStats {
                compile_time_ms: millis(started - run_started),
                execute_time_ms: millis(finished - started),
                cpu_time_ms: usage.cpu_time_ms(),
                memory_usage_bytes: usage.peak_memory_bytes(),
                ..stats
            },
            Phase::Finished {
                started,
                finished: execution_finished,
            } => RunStats {
                compile_time_ms: millis(started - run_started),
                execute_time_ms: millis(execution_finished - started),
                cpu_time_ms: usage.cpu_time_ms(),
                memory_usage_bytes: usage.peak_memory_bytes(),
                ..stats
            },
        };

        let outcome = classify(outcome, cancellation.reason());
        tracing::info!(
            failure = ?outcome.failure_kind(),
            compile_ms = stats.compile_time_ms,
            execute_ms = stats.execute_time_ms,
            "run finished"
        );

        RunResult {
            run_id,
            outcome,
            console_output: console.output().trim_end().to_string(),
            stats,
            teardown_warning: report.warning,
            background_processes_alive: report.lingering_processes,
        }
    }

    /// Waits for the compile latch, then for the execution backstop. Either
    /// timeout cancels the run with [`LimitKind::ExecutionTime`].
    async fn await_execution(
        &self,
        mut execution: JoinHandle<UnitOutcome>,
        mut phase: watch::Receiver<Phase>,
        cancellation: &RunCancellation,
    ) -> UnitOutcome {
        let latch = tokio::time::timeout(self.config.compile_timeout, async {
            tokio::select! {
                biased;
                outcome = &mut execution => Some(outcome),
                _ = execution_started(&mut phase) => None,
            }
        })
        .await;

        let finished = match latch {
            Ok(Some(outcome)) => Some(outcome),
            Ok(None) => tokio::time::timeout(self.config.execution_backstop(), &mut execution)
                .await
                .ok(),
            Err(_) => {
                tracing::warn!(timeout = ?self.config.compile_timeout, "compilation did not finish in time");
                None
            }
        };

        let joined = match finished {
            Some(joined) => joined,
            None => {
                cancellation.trip(CancelReason::Limit(LimitKind::ExecutionTime));
                match tokio::time::timeout(CANCEL_GRACE, &mut execution).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::warn!("execution unit ignored cancellation, aborting");
                        execution.abort();
                        return UnitOutcome::Cancelled;
                    }
                }
            }
        };

        joined.unwrap_or_else(|e| {
            tracing::error!("execution unit failed: {}", e);
            UnitOutcome::Failed(ExecuteError::Internal { msg: e.to_string() })
        })
    }
}

/// Resolves once the execution unit signals that the program started.
async fn execution_started(phase: &mut watch::Receiver<Phase>) {
    loop {
        if phase.borrow_and_update().execution_started().is_some() {
            return;
        }
        if phase.changed().await.is_err() {
            // Unit is gone without starting, its join handle resolves instead.
            std::future::pending::<()>().await;
        }
    }
}

/// Trips the run's cancellation when the caller stops waiting for it.
struct AbandonOnDrop(Option<Arc<RunCancellation>>);

impl AbandonOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if let Some(cancellation) = self.0.take() {
            cancellation.trip(CancelReason::Abandoned);
        }
    }
}

#[derive(Debug)]
enum UnitOutcome {
    Completed,
    CompilerErrors(Vec<Diagnostic>),
    CompileFailed(CompileError),
    Failed(ExecuteError),
    Cancelled,
}

/// Compiles and then executes the user program.
struct ExecutionUnit {
    runtime: Arc<dyn Runtime>,
    probe: Arc<dyn ResourceProbe>,
    sandbox: Arc<SandboxContext>,
    console: Console,
    signals: ExecutionSignals,
    cancellation: Arc<RunCancellation>,
    request: CompileRequest,
}

impl ExecutionUnit {
    async fn run(self) -> UnitOutcome {
        let token = self.cancellation.token().clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => UnitOutcome::Cancelled,
            outcome = self.compile_and_execute() => outcome,
        }
    }

    async fn compile_and_execute(&self) -> UnitOutcome {
        let compilation = match self.runtime.compile(&self.request, &self.sandbox).await {
            Ok(compilation) => compilation,
            Err(e) => return UnitOutcome::CompileFailed(e),
        };
        tracing::debug!(diagnostics = compilation.diagnostics.len(), "compilation finished");

        if compilation.has_errors() {
            return UnitOutcome::CompilerErrors(compilation.diagnostics);
        }
        let Some(artifact) = compilation.artifact else {
            return UnitOutcome::CompileFailed(CompileError::Internal {
                msg: MISSING_ARTIFACT_MSG.to_string(),
            });
        };

        self.sandbox.arm_memory_backstop();
        let baseline = self.probe.sample(&self.sandbox);
        self.signals.starting_execution(baseline);
        let result = self
            .runtime
            .execute(&artifact, &self.console, &self.sandbox)
            .await;
        self.signals.finished_execution();

        match result {
            Ok(()) => UnitOutcome::Completed,
            Err(e) => {
                match &e {
                    ExecuteError::Interrupted(ConsoleInterrupt::InputRequested) => {
                        self.signals.input_requested();
                    }
                    ExecuteError::Interrupted(ConsoleInterrupt::LimitExceeded(kind))
                    | ExecuteError::LimitExceeded(kind) => {
                        self.cancellation.trip(CancelReason::Limit(*kind));
                    }
                    _ => {}
                }
                UnitOutcome::Failed(e)
            }
        }
    }
}

fn classify(outcome: UnitOutcome, reason: Option<CancelReason>) -> RunOutcome {
    if let Some(CancelReason::Limit(kind)) = reason {
        return RunOutcome::limit(kind);
    }

    match outcome {
        UnitOutcome::Completed => RunOutcome::Success {
            input_requested: false,
        },
        UnitOutcome::CompilerErrors(diagnostics) => RunOutcome::CompilerErrors { diagnostics },
        UnitOutcome::CompileFailed(CompileError::Unsupported { msg }) => RunOutcome::fatal(msg),
        UnitOutcome::CompileFailed(CompileError::Internal { msg }) => {
            tracing::error!("compiler failed: {}", msg);
            RunOutcome::fatal(format!("{}: {}", INTERNAL_FAILURE_MSG, msg))
        }
        UnitOutcome::Failed(ExecuteError::Exception(exception)) => {
            RunOutcome::RuntimeException { exception }
        }
        UnitOutcome::Failed(ExecuteError::Interrupted(ConsoleInterrupt::InputRequested)) => {
            RunOutcome::Success {
                input_requested: true,
            }
        }
        UnitOutcome::Failed(ExecuteError::Interrupted(ConsoleInterrupt::LimitExceeded(kind)))
        | UnitOutcome::Failed(ExecuteError::LimitExceeded(kind)) => RunOutcome::limit(kind),
        UnitOutcome::Failed(ExecuteError::Interrupted(ConsoleInterrupt::ReadCharUnsupported)) => {
            RunOutcome::RuntimeException {
                exception: ExceptionInfo::new(READ_CHAR_UNSUPPORTED_TYPE, READ_CHAR_UNSUPPORTED_MSG),
            }
        }
        UnitOutcome::Failed(ExecuteError::Internal { msg }) => {
            tracing::error!("execution failed: {}", msg);
            RunOutcome::fatal(format!("{}: {}", INTERNAL_FAILURE_MSG, msg))
        }
        UnitOutcome::Cancelled => RunOutcome::fatal(CANCELLED_MSG),
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
