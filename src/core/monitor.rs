use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle};
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tokio_util::sync::CancellationToken;

use crate::{
    config::EngineConfig,
    constants::{DIR_CHECK_INTERVAL, MONITOR_POLL_INTERVAL},
    core::{
        cancel::{CancelReason, RunCancellation},
        domain::{LimitKind, ResourceSample},
        events::Phase,
        sandbox::SandboxContext,
        traits::probe::ResourceProbe,
    },
};

#[derive(Debug, Clone, Copy)]
pub struct MonitorLimits {
    pub execution_time: Duration,
    pub memory_bytes: u64,
    pub scratch_bytes: u64,
    /// When false only the scratch directory is watched.
    pub check_time_and_memory: bool,
}

impl MonitorLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        let debugger = debugger_attached();
        if debugger {
            tracing::info!("debugger attached, time and memory limits are not enforced");
        }
        Self {
            execution_time: config.execution_time_limit,
            memory_bytes: config.memory_limit_bytes,
            scratch_bytes: config.scratch_dir_limit_bytes,
            check_time_and_memory: config.monitoring_enabled && !debugger,
        }
    }
}

/// Usage figures collected while monitoring, reported in run stats.
#[derive(Debug, Default)]
pub struct UsageStats {
    peak_memory_bytes: AtomicU64,
    cpu_time_ms: AtomicU64,
}

impl UsageStats {
    /// Only the program counts: nothing is recorded while compiling, and usage
    /// is measured from the sample taken when execution started.
    fn record(&self, sample: ResourceSample, phase: Phase) {
        let Phase::Executing { baseline, .. } = phase else {
            return;
        };
        self.peak_memory_bytes.fetch_max(
            sample.memory_bytes.saturating_sub(baseline.memory_bytes),
            Ordering::Relaxed,
        );
        if let Some(cpu) = sample.cpu_time {
            let spent = cpu.saturating_sub(baseline.cpu_time.unwrap_or_default());
            self.cpu_time_ms
                .fetch_max(spent.as_millis() as u64, Ordering::Relaxed);
        }
    }

    pub fn peak_memory_bytes(&self) -> u64 {
        self.peak_memory_bytes.load(Ordering::Relaxed)
    }

    pub fn cpu_time_ms(&self) -> u64 {
        self.cpu_time_ms.load(Ordering::Relaxed)
    }
}

/// Polls a running sandbox and cancels the run on the first limit breach.
#[derive(Debug)]
pub struct ResourceMonitor {
    limits: MonitorLimits,
    probe: Arc<dyn ResourceProbe>,
    sandbox: Arc<SandboxContext>,
    phase: watch::Receiver<Phase>,
    cancellation: Arc<RunCancellation>,
    usage: Arc<UsageStats>,
}

impl ResourceMonitor {
    pub fn new(
        limits: MonitorLimits,
        probe: Arc<dyn ResourceProbe>,
        sandbox: Arc<SandboxContext>,
        phase: watch::Receiver<Phase>,
        cancellation: Arc<RunCancellation>,
    ) -> Self {
        Self {
            limits,
            probe,
            sandbox,
            phase,
            cancellation,
            usage: Arc::new(UsageStats::default()),
        }
    }

    pub fn usage(&self) -> Arc<UsageStats> {
        self.usage.clone()
    }

    /// Runs until `stop` fires, the run is cancelled, or a limit is breached.
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<Option<LimitKind>> {
        tokio::spawn(self.run(stop))
    }

    #[tracing::instrument(skip_all, fields(sandbox_id = %self.sandbox.id()))]
    async fn run(self, stop: CancellationToken) -> Option<LimitKind> {
        let dir_check_every =
            (DIR_CHECK_INTERVAL.as_millis() / MONITOR_POLL_INTERVAL.as_millis()).max(1) as u64;
        let mut ticks = IntervalStream::new(tokio::time::interval(MONITOR_POLL_INTERVAL));
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return None,
                _ = self.cancellation.token().cancelled() => return None,
                next = ticks.next() => if next.is_none() { return None },
            }

            if let Some(breach) = self.check(tick % dir_check_every == 0).await {
                if self.cancellation.trip(CancelReason::Limit(breach)) {
                    tracing::warn!(limit = ?breach, "resource limit exceeded, cancelling run");
                }
                return Some(breach);
            }
            tick += 1;
        }
    }

    async fn check(&self, check_dir: bool) -> Option<LimitKind> {
        let phase = *self.phase.borrow();
        let sample = self.probe.sample(&self.sandbox);
        self.usage.record(sample, phase);

        if self.limits.check_time_and_memory {
            if let Phase::Executing { started, baseline } = phase {
                if started.elapsed() >= self.limits.execution_time {
                    return Some(LimitKind::ExecutionTime);
                }
                if sample.memory_bytes.saturating_sub(baseline.memory_bytes)
                    >= self.limits.memory_bytes
                {
                    return Some(LimitKind::MemoryUsage);
                }
            }
        }

        if check_dir {
            match self.sandbox.scratch_size().await {
                Ok(size) if size >= self.limits.scratch_bytes => return Some(LimitKind::DirSize),
                Ok(_) => {}
                Err(e) => tracing::debug!("scratch size unavailable: {}", e),
            }
        }

        None
    }
}

/// Whether a tracer is attached to this process.
pub fn debugger_attached() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("TracerPid:"))
                .and_then(|pid| pid.trim().parse::<u32>().ok())
        })
        .is_some_and(|pid| pid != 0)
}
