//! Two-tier (global + per-host) concurrency gate with a bounded acquire
//! timeout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use empresa_core::FailReason;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub struct GateConfig {
    pub global_concurrency: usize,
    pub per_domain_limit: usize,
    pub slow_domain_limit: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 200,
            per_domain_limit: 5,
            slow_domain_limit: 2,
        }
    }
}

struct HostGate {
    semaphore: Arc<Semaphore>,
    slow: AtomicBool,
    cap: AtomicUsize,
}

/// A held slot. Dropping it releases both the per-host and the global
/// permit. Release is therefore guaranteed on every exit path (success,
/// failure, cancellation, panic) for free via `Drop`.
pub struct Lease {
    _global: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

pub struct ConcurrencyGate {
    global: Arc<Semaphore>,
    hosts: DashMap<String, Arc<HostGate>>,
    config: GateConfig,
}

impl ConcurrencyGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.global_concurrency)),
            hosts: DashMap::new(),
            config,
        }
    }

    fn host_gate(&self, host: &str) -> Arc<HostGate> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostGate {
                    semaphore: Arc::new(Semaphore::new(self.config.per_domain_limit)),
                    slow: AtomicBool::new(false),
                    cap: AtomicUsize::new(self.config.per_domain_limit),
                })
            })
            .clone()
    }

    /// Flags a host as slow, permanently shrinking its semaphore from
    /// `per_domain_limit` down to `slow_domain_limit` permits by acquiring
    /// and forgetting the difference. Idempotent.
    pub fn mark_slow(&self, host: &str) {
        let gate = self.host_gate(host);
        if gate.slow.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = gate.cap.load(Ordering::SeqCst);
        let target = self.config.slow_domain_limit.min(current);
        let to_forget = current.saturating_sub(target);
        if to_forget == 0 {
            return;
        }
        if let Ok(permit) = gate.semaphore.clone().try_acquire_many_owned(to_forget as u32) {
            permit.forget();
            gate.cap.fetch_sub(to_forget, Ordering::SeqCst);
            debug!(host, from = current, to = target, "host marked slow, gate shrunk");
        }
    }

    pub fn is_slow(&self, host: &str) -> bool {
        self.hosts
            .get(host)
            .map(|g| g.slow.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn global_capacity(&self) -> usize {
        self.config.global_concurrency
    }

    pub fn global_in_flight(&self) -> usize {
        self.config.global_concurrency.saturating_sub(self.global.available_permits())
    }

    pub fn tracked_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn slow_hosts(&self) -> usize {
        self.hosts.iter().filter(|e| e.value().slow.load(Ordering::Relaxed)).count()
    }

    /// Acquires the global semaphore then the per-host semaphore, sharing
    /// one deadline across both. Within one host, acquires are served
    /// FIFO (the `tokio::sync::Semaphore` guarantee); across hosts, no
    /// ordering is implied.
    pub async fn acquire(&self, host: &str, timeout: Duration) -> Result<Lease, FailReason> {
        let deadline = Instant::now() + timeout;
        let global = self.global.clone();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let global_permit = tokio::time::timeout(remaining, global.acquire_owned())
            .await
            .map_err(|_| FailReason::InfraConcurrencyTimeout)?
            .map_err(|_| FailReason::InfraConcurrencyTimeout)?;

        let host_gate = self.host_gate(host);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let host_permit = tokio::time::timeout(remaining, host_gate.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| FailReason::InfraConcurrencyTimeout)?
            .map_err(|_| FailReason::InfraConcurrencyTimeout)?;

        Ok(Lease {
            _global: global_permit,
            _host: host_permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn global_concurrency_of_one_serialises_acquires() {
        let gate = Arc::new(ConcurrencyGate::new(GateConfig {
            global_concurrency: 1,
            per_domain_limit: 5,
            slow_domain_limit: 2,
        }));
        let lease1 = gate.acquire("a.com", Duration::from_millis(50)).await.unwrap();
        let second = gate.acquire("b.com", Duration::from_millis(50)).await;
        assert!(matches!(second, Err(FailReason::InfraConcurrencyTimeout)));
        drop(lease1);
        assert!(gate.acquire("b.com", Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn per_host_limit_is_enforced_independent_of_other_hosts() {
        let gate = ConcurrencyGate::new(GateConfig {
            global_concurrency: 100,
            per_domain_limit: 1,
            slow_domain_limit: 1,
        });
        let _l1 = gate.acquire("a.com", Duration::from_millis(50)).await.unwrap();
        let second_same_host = gate.acquire("a.com", Duration::from_millis(50)).await;
        assert!(second_same_host.is_err());
        assert!(gate.acquire("b.com", Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn mark_slow_shrinks_host_cap() {
        let gate = ConcurrencyGate::new(GateConfig {
            global_concurrency: 100,
            per_domain_limit: 5,
            slow_domain_limit: 2,
        });
        gate.mark_slow("slow.com");
        let l1 = gate.acquire("slow.com", Duration::from_millis(50)).await.unwrap();
        let l2 = gate.acquire("slow.com", Duration::from_millis(50)).await.unwrap();
        let third = gate.acquire("slow.com", Duration::from_millis(50)).await;
        assert!(third.is_err());
        drop((l1, l2));
    }
}
