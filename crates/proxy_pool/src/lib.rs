//! Holds proxy endpoints, health-probes them at startup, routes allocations
//! via weighted-random based on observed success rate, records outcomes.

use std::sync::Arc;

use empresa_core::{FailReason, Proxy};
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

pub struct ProxyPoolConfig {
    pub min_success_rate: f64,
    pub min_observations: u64,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            min_success_rate: 0.10,
            min_observations: 8,
        }
    }
}

/// A single bucket in the observability histogram.
#[derive(Debug, Clone, Copy)]
pub struct Bucket {
    pub lo: u8,
    pub hi: u8,
    pub count: usize,
}

/// The condensed view of pool health carried in the batch status object,
/// as opposed to the detailed [`PoolStats`] histogram meant for standalone
/// pool inspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSummary {
    pub total: usize,
    pub active: usize,
    pub discarded: usize,
    pub avg_success_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub proxies_analyzed: usize,
    pub proxies_unused: usize,
    pub buckets: Vec<Bucket>,
    pub std_dev: f64,
    pub percentiles: Vec<(u8, f64)>,
    pub worst5: Vec<(u32, f64)>,
    pub best5: Vec<(u32, f64)>,
}

/// Holds every `Proxy` and performs weighted-random selection. Never
/// blocks on pool emptiness: with no eligible weighted proxy it falls back
/// to a uniformly random active one.
pub struct ProxyPool {
    proxies: Vec<Arc<Proxy>>,
    config: ProxyPoolConfig,
}

impl ProxyPool {
    pub fn new(endpoints: Vec<String>, config: ProxyPoolConfig) -> Self {
        let proxies = endpoints
            .into_iter()
            .enumerate()
            .map(|(i, endpoint)| Arc::new(Proxy::new(i as u32, endpoint)))
            .collect();
        Self { proxies, config }
    }

    /// Health-probes every proxy in parallel against `probe`, which should
    /// perform a short-timeout request to a known-good target and return
    /// whether the proxy itself answered (not whether the target did).
    /// Dead proxies are marked `discarded`: excluded from selection but
    /// kept for observability.
    pub async fn health_check<F, Fut>(&self, probe: F)
    where
        F: Fn(Arc<Proxy>) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = bool> + Send,
    {
        let mut handles = Vec::with_capacity(self.proxies.len());
        for proxy in &self.proxies {
            let proxy = proxy.clone();
            let probe = probe.clone();
            handles.push(tokio::spawn(async move {
                let alive = probe(proxy.clone()).await;
                if !alive {
                    proxy.mark_discarded();
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        let discarded = self.proxies.iter().filter(|p| p.is_discarded()).count();
        info!(
            total = self.proxies.len(),
            discarded, "proxy pool health check complete"
        );
    }

    /// Never blocks on pool emptiness. Proxies below the success-rate
    /// floor (after enough observations) are excluded from the weights;
    /// remaining proxies are weighted by `max(epsilon, success_rate)`.
    /// If no proxy is eligible for weighting, returns a uniformly random
    /// active proxy. Returns `None` only if every proxy is discarded.
    pub fn borrow(&self) -> Option<Arc<Proxy>> {
        const EPSILON: f64 = 0.01;
        let active: Vec<&Arc<Proxy>> = self.proxies.iter().filter(|p| !p.is_discarded()).collect();
        if active.is_empty() {
            return None;
        }

        let eligible: Vec<(&Arc<Proxy>, f64)> = active
            .iter()
            .filter(|p| {
                p.observations() < self.config.min_observations
                    || p.success_rate() >= self.config.min_success_rate
            })
            .map(|p| (*p, p.success_rate().max(EPSILON)))
            .collect();

        let weights_sum: f64 = eligible.iter().map(|(_, w)| w).sum();
        if eligible.is_empty() || weights_sum <= 0.0 {
            let idx = rand::thread_rng().gen_range(0..active.len());
            active[idx].record_allocation();
            return Some(active[idx].clone());
        }

        let mut roll = rand::thread_rng().gen_range(0.0..weights_sum);
        for (proxy, weight) in &eligible {
            if roll < *weight {
                proxy.record_allocation();
                return Some((*proxy).clone());
            }
            roll -= weight;
        }
        eligible.last().map(|(p, _)| {
            p.record_allocation();
            (*p).clone()
        })
    }

    /// Reports the outcome of an allocation. `infra:cancelled` is
    /// intentionally never routed here by callers — it is an allocation
    /// without an observed outcome, so it must not move `success_rate`.
    pub fn report(&self, proxy: &Proxy, ok: bool, reason: Option<FailReason>) {
        if let Some(r) = reason {
            if r.is_cancellation() {
                warn!(proxy = proxy.id, "dropping cancelled outcome from weighting");
                return;
            }
        }
        proxy.record_outcome(ok);
    }

    pub fn proxies(&self) -> &[Arc<Proxy>] {
        &self.proxies
    }

    pub fn summary(&self) -> PoolSummary {
        let active: Vec<&Arc<Proxy>> = self.proxies.iter().filter(|p| !p.is_discarded()).collect();
        let avg_success_rate = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|p| p.success_rate()).sum::<f64>() / active.len() as f64
        };
        PoolSummary {
            total: self.proxies.len(),
            active: active.len(),
            discarded: self.proxies.len() - active.len(),
            avg_success_rate,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut buckets = vec![
            Bucket { lo: 0, hi: 10, count: 0 },
            Bucket { lo: 10, hi: 30, count: 0 },
            Bucket { lo: 30, hi: 50, count: 0 },
            Bucket { lo: 50, hi: 70, count: 0 },
            Bucket { lo: 70, hi: 90, count: 0 },
            Bucket { lo: 90, hi: 100, count: 0 },
        ];
        let mut rates: Vec<(u32, f64)> = Vec::new();
        for p in self.proxies.iter().filter(|p| !p.is_discarded()) {
            let pct = p.success_rate() * 100.0;
            for b in &mut buckets {
                if pct >= b.lo as f64 && (pct < b.hi as f64 || b.hi == 100) {
                    b.count += 1;
                    break;
                }
            }
            rates.push((p.id, p.success_rate()));
        }

        let mean = if rates.is_empty() {
            0.0
        } else {
            rates.iter().map(|(_, r)| r).sum::<f64>() / rates.len() as f64
        };
        let variance = if rates.is_empty() {
            0.0
        } else {
            rates.iter().map(|(_, r)| (r - mean).powi(2)).sum::<f64>() / rates.len() as f64
        };
        let std_dev = variance.sqrt();

        let mut sorted = rates.clone();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let percentiles = [10u8, 25, 50, 75, 90]
            .iter()
            .map(|&p| {
                let idx = ((p as f64 / 100.0) * (sorted.len().saturating_sub(1)) as f64).round() as usize;
                (p, sorted.get(idx).map(|(_, r)| *r).unwrap_or(0.0))
            })
            .collect();

        let mut by_rate = sorted.clone();
        let worst5: Vec<(u32, f64)> = by_rate.iter().take(5).cloned().collect();
        by_rate.reverse();
        let best5: Vec<(u32, f64)> = by_rate.iter().take(5).cloned().collect();

        PoolStats {
            proxies_analyzed: self.proxies.len(),
            proxies_unused: self.proxies.iter().filter(|p| p.is_discarded()).count(),
            buckets,
            std_dev,
            percentiles,
            worst5,
            best5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrow_returns_none_when_all_discarded() {
        let pool = ProxyPool::new(vec!["a".into(), "b".into()], ProxyPoolConfig::default());
        for p in pool.proxies() {
            p.mark_discarded();
        }
        assert!(pool.borrow().is_none());
    }

    #[test]
    fn weighted_selection_excludes_below_floor_after_enough_observations() {
        let pool = ProxyPool::new(vec!["a".into(), "b".into()], ProxyPoolConfig::default());
        let bad = pool.proxies()[0].clone();
        let good = pool.proxies()[1].clone();
        for _ in 0..20 {
            bad.record_outcome(false);
        }
        for _ in 0..20 {
            good.record_outcome(true);
        }
        let mut good_draws = 0;
        for _ in 0..200 {
            if let Some(p) = pool.borrow() {
                if p.id == good.id {
                    good_draws += 1;
                }
            }
        }
        assert!(good_draws > 150, "expected good proxy to dominate draws, got {good_draws}/200");
    }

    #[test]
    fn cancelled_outcome_is_not_recorded() {
        let pool = ProxyPool::new(vec!["a".into()], ProxyPoolConfig::default());
        let p = pool.proxies()[0].clone();
        pool.report(&p, false, Some(FailReason::InfraCancelled));
        assert_eq!(p.observations(), 0);
    }

    #[test]
    fn allocations_always_at_least_observations() {
        let pool = ProxyPool::new(vec!["a".into()], ProxyPoolConfig::default());
        let p = pool.proxies()[0].clone();
        for _ in 0..5 {
            if let Some(picked) = pool.borrow() {
                pool.report(&picked, true, None);
            }
        }
        assert!(p.allocations() >= p.successes() + p.failures());
    }
}
