use std::time::Instant;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::core::domain::ResourceSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleEventKind {
    StartingExecution,
    FinishedExecution,
    InputRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub run_id: Uuid,
    pub kind: LifecycleEventKind,
}

/// Where the execution unit currently is. Watched by the monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    Compiling,
    /// `baseline` is what the sandbox used just before the program started.
    Executing { started: Instant, baseline: ResourceSample },
    Finished { started: Instant, finished: Instant },
}

impl Phase {
    pub fn execution_started(&self) -> Option<Instant> {
        match self {
            Phase::Compiling => None,
            Phase::Executing { started, .. } | Phase::Finished { started, .. } => Some(*started),
        }
    }
}

/// Signals raised by the execution unit: phase changes for the monitor and the
/// orchestrator, lifecycle events for external subscribers.
#[derive(Debug, Clone)]
pub struct ExecutionSignals {
    run_id: Uuid,
    phase: watch::Sender<Phase>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ExecutionSignals {
    pub fn new(run_id: Uuid, events: broadcast::Sender<LifecycleEvent>) -> Self {
        let (phase, _) = watch::channel(Phase::Compiling);
        Self {
            run_id,
            phase,
            events,
        }
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn starting_execution(&self, baseline: ResourceSample) -> Instant {
        let started = Instant::now();
        self.phase.send_replace(Phase::Executing { started, baseline });
        self.emit(LifecycleEventKind::StartingExecution);
        started
    }

    pub fn finished_execution(&self) {
        let finished = Instant::now();
        self.phase.send_modify(|phase| {
            if let Some(started) = phase.execution_started() {
                *phase = Phase::Finished { started, finished };
            }
        });
        self.emit(LifecycleEventKind::FinishedExecution);
    }

    pub fn input_requested(&self) {
        self.emit(LifecycleEventKind::InputRequested);
    }

    fn emit(&self, kind: LifecycleEventKind) {
        tracing::debug!(run_id = %self.run_id, ?kind, "lifecycle event");
        // Nobody listening is fine.
        let _ = self.events.send(LifecycleEvent {
            run_id: self.run_id,
            kind,
        });
    }
}
