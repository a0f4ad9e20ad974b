//! Batch entry point: spawns a fixed worker pool that drains a shared
//! work queue, each worker
//! running one company at a time through [`scrape_company`]; a dedicated
//! task collects results so callers never contend on a shared `Vec`. The
//! worker-pool / shutdown-broadcast / ctrl_c shape follows the pattern the
//! original crawler used for its per-network workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use empresa_core::{CompanyWork, ScrapeResult};
use empresa_proxy_pool::PoolSummary;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::company::scrape_company;
use crate::context::ScrapeContext;

#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencySnapshot {
    pub global_capacity: usize,
    pub global_in_flight: usize,
    pub tracked_hosts: usize,
    pub slow_hosts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub throttled: u64,
    pub not_throttled: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub closed: usize,
    pub half_open: usize,
    pub open: usize,
    pub open_hosts: Vec<String>,
}

/// The cross-component health picture reported alongside per-company
/// metrics in the batch status object.
#[derive(Debug, Clone, Serialize)]
pub struct InfrastructureSnapshot {
    pub proxy_pool: PoolSummary,
    pub concurrency: ConcurrencySnapshot,
    pub rate_limiter: RateLimiterSnapshot,
    pub circuit_breaker: CircuitBreakerSnapshot,
}

impl InfrastructureSnapshot {
    fn capture(ctx: &ScrapeContext) -> Self {
        let (closed, half_open, open) = ctx.breaker.state_counts();
        let (throttled, not_throttled) = ctx.rate_limiter.totals();
        Self {
            proxy_pool: ctx.proxy_pool.summary(),
            concurrency: ConcurrencySnapshot {
                global_capacity: ctx.gate.global_capacity(),
                global_in_flight: ctx.gate.global_in_flight(),
                tracked_hosts: ctx.gate.tracked_hosts(),
                slow_hosts: ctx.gate.slow_hosts(),
            },
            rate_limiter: RateLimiterSnapshot { throttled, not_throttled },
            circuit_breaker: CircuitBreakerSnapshot {
                closed,
                half_open,
                open,
                open_hosts: ctx.breaker.open_hosts(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub status: String,
    pub elapsed_seconds: u64,
    pub instances: usize,
    #[serde(flatten)]
    pub snapshot: empresa_metrics::FabricSnapshot,
    pub infrastructure: InfrastructureSnapshot,
}

/// One running (or finished) batch. Holds the explicit `ScrapeContext`
/// every worker shares, never a global.
pub struct BatchRegistry {
    ctx: Arc<ScrapeContext>,
    batch_id: String,
    instances: usize,
    started_at: Instant,
    done: AtomicBool,
}

impl BatchRegistry {
    pub fn new(ctx: Arc<ScrapeContext>, batch_id: impl Into<String>, instances: usize) -> Self {
        Self {
            ctx,
            batch_id: batch_id.into(),
            instances: instances.max(1),
            started_at: Instant::now(),
            done: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> BatchStatus {
        BatchStatus {
            batch_id: self.batch_id.clone(),
            status: if self.done.load(Ordering::Relaxed) { "done".to_string() } else { "running".to_string() },
            elapsed_seconds: self.started_at.elapsed().as_secs(),
            instances: self.instances,
            snapshot: self.ctx.metrics.snapshot(),
            infrastructure: InfrastructureSnapshot::capture(&self.ctx),
        }
    }

    /// Runs `work` to completion across the worker pool, honoring Ctrl+C:
    /// on signal, workers finish their in-flight company then stop pulling
    /// new work, and whatever has been collected so far is returned.
    pub async fn run(&self, work: Vec<CompanyWork>) -> Vec<(CompanyWork, ScrapeResult)> {
        let queue = Arc::new(Mutex::new(VecDeque::from(work)));
        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();

        let mut workers = Vec::with_capacity(self.instances);
        for worker_id in 0..self.instances {
            let queue = queue.clone();
            let ctx = self.ctx.clone();
            let results_tx = results_tx.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                loop {
                    if shutdown_rx.try_recv().is_ok() {
                        break;
                    }
                    let next = queue.lock().await.pop_front();
                    let Some(item) = next else { break };
                    info!(worker_id, registration_id = %item.registration_id, "starting company scrape");
                    let result = scrape_company(&ctx, &item).await;
                    if results_tx.send((item, result)).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(results_tx);

        let shutdown_tx_ctrlc = shutdown_tx.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl_c received, signalling batch workers to wind down");
                let _ = shutdown_tx_ctrlc.send(());
            }
        });

        let mut collected = Vec::new();
        while let Some(pair) = results_rx.recv().await {
            collected.push(pair);
        }

        for w in workers {
            let _ = w.await;
        }
        ctrl_c.abort();

        self.done.store(true, Ordering::Relaxed);
        collected
    }
}
