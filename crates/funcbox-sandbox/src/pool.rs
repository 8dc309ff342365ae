//! Pool of [`Sandbox`]es for concurrent execution.
//!
//! A [`Sandbox`] runs one call at a time. The pool bounds how many run
//! concurrently and recycles sandboxes after `max_uses` calls or a fatal
//! outcome.
//!
//! Every call still gets a fresh V8 isolate; pooling never shares guest
//! state between executions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLogger, NoopAuditLogger};
use crate::error::{ErrorKind, SandboxError};
use crate::executor::{Sandbox, SandboxConfig};
use crate::function::{FunctionInput, FunctionOutput};

/// Configuration for the sandbox pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum sandboxes alive (idle plus checked out).
    pub max_sandboxes: usize,
    /// Retire a sandbox after this many executions.
    pub max_uses: u64,
    /// Close idle sandboxes after this duration.
    pub max_idle_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sandboxes: 8,
            max_uses: 50,
            max_idle_time: Duration::from_secs(60),
        }
    }
}

/// Atomic counters for pool observability.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Sandboxes created.
    pub created: AtomicU64,
    /// Acquisitions served from the idle set.
    pub reused: AtomicU64,
    /// Sandboxes retired at `max_uses`.
    pub recycled: AtomicU64,
    /// Sandboxes closed after a fatal outcome or an unreleased handle.
    pub discarded: AtomicU64,
    /// Sandboxes closed for idling past `max_idle_time`.
    pub reaped: AtomicU64,
}

/// Outcome of using a sandbox, reported back to the pool on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReleaseOutcome {
    /// The sandbox can be reused.
    Ok,
    /// The sandbox must be closed.
    Fatal,
}

impl ReleaseOutcome {
    /// Fatal for aborted executions (timeout, memory, cancellation) and
    /// environment setup failures.
    pub fn for_output(output: &FunctionOutput) -> Self {
        match output.error_kind {
            Some(
                ErrorKind::Timeout
                | ErrorKind::ResourceExceeded
                | ErrorKind::Cancelled
                | ErrorKind::Setup,
            ) => Self::Fatal,
            _ => Self::Ok,
        }
    }
}

struct IdleSandbox {
    sandbox: Sandbox,
    idle_since: Instant,
}

/// A checked-out sandbox. Release it with [`SandboxPool::release`];
/// dropping it closes the sandbox and frees its slot.
pub struct AcquiredSandbox {
    sandbox: Option<Sandbox>,
    alive: Arc<AtomicUsize>,
    metrics: Arc<PoolMetrics>,
}

impl std::fmt::Debug for AcquiredSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredSandbox")
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

impl AcquiredSandbox {
    /// Execute on this sandbox.
    pub async fn execute(&mut self, input: FunctionInput) -> Result<FunctionOutput, SandboxError> {
        self.execute_with_cancellation(input, CancellationToken::new())
            .await
    }

    /// Execute on this sandbox, aborting when `cancel` fires.
    pub async fn execute_with_cancellation(
        &mut self,
        input: FunctionInput,
        cancel: CancellationToken,
    ) -> Result<FunctionOutput, SandboxError> {
        match self.sandbox.as_mut() {
            Some(sb) => sb.execute_with_cancellation(input, cancel).await,
            None => Err(SandboxError::Closed),
        }
    }

    /// Executions served by the underlying sandbox.
    pub fn execution_count(&self) -> u64 {
        self.sandbox.as_ref().map_or(0, Sandbox::execution_count)
    }
}

impl Drop for AcquiredSandbox {
    fn drop(&mut self) {
        if let Some(mut sb) = self.sandbox.take() {
            sb.close();
            self.alive.fetch_sub(1, Ordering::SeqCst);
            self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("unreleased sandbox handle dropped");
        }
    }
}

/// A bounded pool of sandboxes sharing one configuration.
pub struct SandboxPool {
    sandbox_config: SandboxConfig,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleSandbox>>,
    /// Sandboxes alive (idle plus checked out).
    alive: Arc<AtomicUsize>,
    metrics: Arc<PoolMetrics>,
    shutting_down: AtomicBool,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    sandbox_metrics: Option<Arc<crate::metrics::SandboxMetrics>>,
}

impl SandboxPool {
    /// Create an empty pool. Sandboxes are created on demand.
    pub fn new(sandbox_config: SandboxConfig, config: PoolConfig) -> Self {
        Self::with_audit_logger(sandbox_config, config, Arc::new(NoopAuditLogger))
    }

    /// Create an empty pool whose sandboxes report to `logger`.
    pub fn with_audit_logger(
        sandbox_config: SandboxConfig,
        config: PoolConfig,
        logger: Arc<dyn AuditLogger>,
    ) -> Self {
        let config = if config.max_sandboxes == 0 {
            tracing::warn!("max_sandboxes is zero, using default");
            PoolConfig {
                max_sandboxes: PoolConfig::default().max_sandboxes,
                ..config
            }
        } else {
            config
        };
        Self {
            sandbox_config: sandbox_config.normalized(),
            config,
            idle: Mutex::new(VecDeque::new()),
            alive: Arc::new(AtomicUsize::new(0)),
            metrics: Arc::new(PoolMetrics::default()),
            shutting_down: AtomicBool::new(false),
            audit_logger: logger,
            #[cfg(feature = "metrics")]
            sandbox_metrics: None,
        }
    }

    /// Record executions and the alive gauge into `metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::SandboxMetrics>) -> Self {
        self.sandbox_metrics = Some(metrics);
        self
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pool counters.
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Sandboxes currently alive.
    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    /// Sandboxes currently idle.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    fn update_gauge(&self) {
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.sandbox_metrics {
            m.pool_sandboxes_alive.set(self.alive() as i64);
        }
    }

    fn new_sandbox(&self) -> Sandbox {
        let sandbox = Sandbox::with_audit_logger(self.sandbox_config.clone(), self.audit_logger.clone());
        #[cfg(feature = "metrics")]
        let sandbox = match &self.sandbox_metrics {
            Some(m) => sandbox.with_metrics(m.clone()),
            None => sandbox,
        };
        sandbox
    }

    fn handle(&self, sandbox: Sandbox) -> AcquiredSandbox {
        AcquiredSandbox {
            sandbox: Some(sandbox),
            alive: self.alive.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Take an idle sandbox, or create one if under capacity.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self) -> Result<AcquiredSandbox, SandboxError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SandboxError::PoolShutdown);
        }

        if let Some(idle) = self.idle.lock().await.pop_front() {
            self.metrics.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(self.handle(idle.sandbox));
        }

        let max = self.config.max_sandboxes;
        let reserved = self
            .alive
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1));
        if reserved.is_err() {
            return Err(SandboxError::PoolExhausted { max });
        }
        self.metrics.created.fetch_add(1, Ordering::Relaxed);
        self.update_gauge();
        tracing::debug!(alive = self.alive(), "sandbox created");
        Ok(self.handle(self.new_sandbox()))
    }

    /// Return a sandbox to the pool.
    ///
    /// The sandbox is closed instead on [`ReleaseOutcome::Fatal`], after
    /// `max_uses` executions, or when the pool is shutting down.
    #[tracing::instrument(skip(self, handle), fields(outcome = ?outcome))]
    pub async fn release(&self, mut handle: AcquiredSandbox, outcome: ReleaseOutcome) {
        let Some(sandbox) = handle.sandbox.take() else {
            return;
        };

        if outcome == ReleaseOutcome::Fatal {
            self.retire(sandbox);
            self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if sandbox.execution_count() >= self.config.max_uses {
            self.retire(sandbox);
            self.metrics.recycled.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            self.retire(sandbox);
            return;
        }

        self.idle.lock().await.push_back(IdleSandbox {
            sandbox,
            idle_since: Instant::now(),
        });
    }

    /// Acquire, execute and release in one step.
    pub async fn execute(&self, input: FunctionInput) -> Result<FunctionOutput, SandboxError> {
        self.execute_with_cancellation(input, CancellationToken::new())
            .await
    }

    /// [`execute`](Self::execute) with external cancellation.
    pub async fn execute_with_cancellation(
        &self,
        input: FunctionInput,
        cancel: CancellationToken,
    ) -> Result<FunctionOutput, SandboxError> {
        let mut handle = self.acquire().await?;
        match handle.execute_with_cancellation(input, cancel).await {
            Ok(output) => {
                self.release(handle, ReleaseOutcome::for_output(&output))
                    .await;
                Ok(output)
            }
            Err(e) => {
                self.release(handle, ReleaseOutcome::Fatal).await;
                Err(e)
            }
        }
    }

    /// Close idle sandboxes older than `max_idle_time`. Returns how many
    /// were closed.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Sandbox> = {
            let mut idle = self.idle.lock().await;
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = idle
                .drain(..)
                .partition(|s| now.duration_since(s.idle_since) >= self.config.max_idle_time);
            *idle = kept;
            expired.into_iter().map(|s| s.sandbox).collect()
        };
        let count = expired.len();
        for sandbox in expired {
            self.retire(sandbox);
            self.metrics.reaped.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    /// Refuse new acquisitions and close idle sandboxes. Checked-out
    /// sandboxes are closed when released. Idempotent.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let drained: Vec<IdleSandbox> = self.idle.lock().await.drain(..).collect();
        for idle in drained {
            self.retire(idle.sandbox);
        }
        tracing::debug!(alive = self.alive(), "sandbox pool shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn retire(&self, mut sandbox: Sandbox) {
        sandbox.close();
        self.alive.fetch_sub(1, Ordering::SeqCst);
        self.update_gauge();
    }
}
