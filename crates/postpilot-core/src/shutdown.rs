//! Draining shutdown for the orchestrator
//!
//! Shutdown stops admitting pipelines, gives in-flight ones `drain_timeout`
//! to finish on their own, cancels whatever is left, and only then stops
//! the background loops. Pipelines keep the retry scheduler and event bus
//! they depend on until the end of the drain.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Time cancelled pipelines get to record their failure
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Not admitting pipelines; waiting for in-flight ones
    Draining,
    /// Drain timed out; remaining pipelines were cancelled
    Cancelling,
    Stopped,
}

impl ShutdownPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            2 => Self::Cancelling,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Cancelling => "cancelling",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a shutdown went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// In flight when shutdown began
    pub in_flight: usize,
    /// Still running at the drain timeout and cancelled
    pub cancelled: usize,
}

/// Admission control and ordered teardown shared by the whole application.
pub struct ShutdownController {
    phase: AtomicU8,
    /// Parent of every background loop's token
    loops: CancellationToken,
    /// Parent of every admitted pipeline's token
    pipelines: CancellationToken,
    in_flight: watch::Sender<usize>,
    drain_timeout: Duration,
}

impl ShutdownController {
    /// Controller that waits `drain_timeout` for pipelines before cancelling them
    #[must_use]
    pub fn with_timeout(drain_timeout: Duration) -> Arc<Self> {
        let (in_flight, _) = watch::channel(0);
        Arc::new(Self {
            phase: AtomicU8::new(ShutdownPhase::Running as u8),
            loops: CancellationToken::new(),
            pipelines: CancellationToken::new(),
            in_flight,
            drain_timeout,
        })
    }

    /// Token for a background loop; fires after pipelines are drained.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.loops.child_token()
    }

    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_accepting_work(&self) -> bool {
        self.phase() == ShutdownPhase::Running
    }

    /// Pipelines currently holding a [`PipelineGuard`]
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Admit one pipeline, or `None` once shutdown has begun.
    pub fn admit(self: &Arc<Self>) -> Option<PipelineGuard> {
        if !self.is_accepting_work() {
            return None;
        }
        self.in_flight.send_modify(|n| *n += 1);
        let guard = PipelineGuard {
            controller: Arc::clone(self),
        };
        // shutdown may have started between the check and the increment;
        // dropping the guard undoes the count
        if !self.is_accepting_work() {
            return None;
        }
        Some(guard)
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
        info!(phase = %phase, "Shutdown phase changed");
    }

    /// Resolve once no pipeline is in flight, or `false` after `limit`.
    async fn wait_idle(&self, limit: Duration) -> bool {
        let mut rx = self.in_flight.subscribe();
        let idle = async move {
            loop {
                let count = *rx.borrow_and_update();
                if count == 0 || rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(limit, idle).await.is_ok()
    }

    /// Drain pipelines, then stop the background loops.
    ///
    /// Returns `None` if shutdown was already started by another caller.
    pub async fn shutdown(&self) -> Option<DrainReport> {
        let started = self.phase.compare_exchange(
            ShutdownPhase::Running as u8,
            ShutdownPhase::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if started.is_err() {
            return None;
        }

        let in_flight = self.in_flight();
        info!(
            in_flight,
            timeout_secs = self.drain_timeout.as_secs(),
            "Draining pipelines"
        );

        let mut cancelled = 0;
        if !self.wait_idle(self.drain_timeout).await {
            cancelled = self.in_flight();
            warn!(cancelled, "Drain timeout exceeded, cancelling pipelines");
            self.set_phase(ShutdownPhase::Cancelling);
            self.pipelines.cancel();
            if !self.wait_idle(CANCEL_GRACE).await {
                error!(
                    remaining = self.in_flight(),
                    "Cancelled pipelines did not finish"
                );
            }
        }

        self.loops.cancel();
        self.set_phase(ShutdownPhase::Stopped);
        Some(DrainReport {
            in_flight,
            cancelled,
        })
    }
}

/// Held by a running pipeline; the drain waits for every guard to drop.
pub struct PipelineGuard {
    controller: Arc<ShutdownController>,
}

impl PipelineGuard {
    /// Token cancelled when the drain gives up on this pipeline
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.controller.pipelines.child_token()
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        self.controller
            .in_flight
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Resolve on Ctrl+C or SIGTERM.
///
/// A handler that fails to install is logged and never fires.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
