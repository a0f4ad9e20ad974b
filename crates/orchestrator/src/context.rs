//! Explicit scrape context: every component the Orchestrator drives lives
//! behind one value passed to each worker, never a module-level
//! singleton. One context per process; tests instantiate a fresh one.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use empresa_breaker::{BreakerConfig, CircuitBreaker};
use empresa_core::collaborators::{CandidateUrlSource, StaticCandidateSource};
use empresa_core::config::AppConfig;
use empresa_core::{FailReason, Proxy};
use empresa_fetcher::{HttpFetcher, Soft404Cache, Strategy};
use empresa_gate::{ConcurrencyGate, GateConfig};
use empresa_metrics::MetricsRegistry;
use empresa_prober::UrlProber;
use empresa_proxy_pool::{ProxyPool, ProxyPoolConfig};
use empresa_ratelimit::{RateLimiter, RateLimiterConfig};
use std::sync::Arc;

/// Moving p95-over-a-window latency tracker that feeds the Gate's
/// slow-domain flag. Kept here rather than inside the Gate itself, since
/// the Gate and the Breaker must stay independent maps that only the
/// Orchestrator touches together.
struct HostLatencyTracker {
    window: usize,
    threshold_ms: u64,
    samples: DashMap<String, Mutex<VecDeque<u64>>>,
}

impl HostLatencyTracker {
    fn new(threshold_ms: u64) -> Self {
        Self {
            window: 20,
            threshold_ms,
            samples: DashMap::new(),
        }
    }

    fn record_and_maybe_flag(&self, host: &str, elapsed_ms: u64, gate: &ConcurrencyGate) {
        let entry = self
            .samples
            .entry(host.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::with_capacity(self.window)));
        let p95 = {
            let mut dq = entry.lock().unwrap();
            dq.push_back(elapsed_ms);
            if dq.len() > self.window {
                dq.pop_front();
            }
            if dq.len() < 5 {
                return;
            }
            let mut sorted: Vec<u64> = dq.iter().copied().collect();
            sorted.sort_unstable();
            let idx = ((0.95 * (sorted.len() - 1) as f64).round()) as usize;
            sorted[idx]
        };
        if p95 > self.threshold_ms {
            gate.mark_slow(host);
        }
    }
}

pub struct ScrapeContext {
    pub proxy_pool: Arc<ProxyPool>,
    pub gate: Arc<ConcurrencyGate>,
    pub rate_limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub fetcher: Arc<HttpFetcher>,
    pub soft_404_cache: Arc<Soft404Cache>,
    pub prober: Arc<UrlProber>,
    pub metrics: Arc<MetricsRegistry>,
    pub config: AppConfig,
    pub candidate_source: Arc<dyn CandidateUrlSource>,
    latency_tracker: HostLatencyTracker,
}

impl ScrapeContext {
    pub fn new(config: AppConfig, proxy_endpoints: Vec<String>, expected_companies: u64) -> Self {
        Self::with_candidate_source(
            config,
            proxy_endpoints,
            expected_companies,
            Arc::new(StaticCandidateSource::new()),
        )
    }

    /// Same as [`Self::new`], but lets the caller supply a
    /// `CandidateUrlSource` that resolves a bare `trade_name`/`city` into
    /// candidate URLs for companies submitted without one.
    pub fn with_candidate_source(
        config: AppConfig,
        proxy_endpoints: Vec<String>,
        expected_companies: u64,
        candidate_source: Arc<dyn CandidateUrlSource>,
    ) -> Self {
        let proxy_pool = Arc::new(ProxyPool::new(
            proxy_endpoints,
            ProxyPoolConfig {
                min_success_rate: config.proxy_pool.proxy_min_success_rate,
                min_observations: config.proxy_pool.proxy_min_observations,
            },
        ));
        let gate = Arc::new(ConcurrencyGate::new(GateConfig {
            global_concurrency: config.gate.global_concurrency,
            per_domain_limit: config.gate.per_domain_limit,
            slow_domain_limit: config.gate.slow_domain_limit,
        }));
        let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            rpm_default: config.rate_limiter.rpm_default,
            rpm_slow: config.rate_limiter.rpm_slow,
            burst_size: config.rate_limiter.burst_size,
        }));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: config.breaker.breaker_threshold,
            recovery_timeout: Duration::from_millis(config.breaker.breaker_recovery_ms),
            half_open_max_tests: config.breaker.breaker_half_open_max,
        }));
        let fetcher = Arc::new(HttpFetcher::new(
            config.fetcher.fetch_timeout_ms_fast,
            config.fetcher.fetch_timeout_ms_slow,
        ));
        let soft_404_cache = Arc::new(Soft404Cache::new());
        let prober = Arc::new(UrlProber::new(fetcher.clone(), soft_404_cache.clone()));
        let metrics = Arc::new(MetricsRegistry::new(expected_companies));
        let latency_tracker = HostLatencyTracker::new(config.gate.slow_p95_threshold_ms);

        Self {
            proxy_pool,
            gate,
            rate_limiter,
            breaker,
            fetcher,
            soft_404_cache,
            prober,
            metrics,
            config,
            candidate_source,
            latency_tracker,
        }
    }

    /// Health-probes every proxy against `target` before the batch starts.
    pub async fn health_check_proxies(&self, target: String) {
        let fetcher = self.fetcher.clone();
        let cache = self.soft_404_cache.clone();
        self.proxy_pool
            .health_check(move |proxy| {
                let fetcher = fetcher.clone();
                let cache = cache.clone();
                let target = target.clone();
                async move {
                    let outcome = fetcher
                        .fetch(
                            &target,
                            &proxy.endpoint,
                            Strategy::Fast,
                            Duration::from_secs(5),
                            "health-check",
                            &cache,
                            true,
                            false,
                        )
                        .await;
                    outcome.is_ok()
                }
            })
            .await;
    }

    /// Runs the shared gate → breaker → rate-limiter → proxy-pool →
    /// fetcher pipeline for one `(host, url, strategy)` attempt, bounded
    /// by the overall per-company deadline. Borrows a fresh proxy from the
    /// pool.
    pub async fn fetch_via_pipeline(
        &self,
        host: &str,
        url: &str,
        strategy: Strategy,
        overall_deadline: Instant,
    ) -> Result<(Vec<u8>, u16, String, u64), FailReason> {
        self.fetch_with_proxy(host, url, strategy, overall_deadline, None)
            .await
            .map(|(bytes, status, final_url, elapsed_ms, _proxy)| (bytes, status, final_url, elapsed_ms))
    }

    /// Same pipeline, but lets the caller pin a specific proxy (used by the
    /// subpage batcher, which keeps one proxy per batch) and hands the
    /// chosen proxy back so the caller can reuse it for the next call.
    pub async fn fetch_with_proxy(
        &self,
        host: &str,
        url: &str,
        strategy: Strategy,
        overall_deadline: Instant,
        proxy_override: Option<Arc<Proxy>>,
    ) -> Result<(Vec<u8>, u16, String, u64, Arc<Proxy>), FailReason> {
        let remaining = |d: Instant| d.saturating_duration_since(Instant::now());

        let gate_timeout = remaining(overall_deadline);
        if gate_timeout.is_zero() {
            return Err(FailReason::InfraDeadline);
        }
        let lease = self.gate.acquire(host, gate_timeout).await?;

        if !self.breaker.should_attempt(host) {
            return Err(FailReason::InfraCircuitOpen);
        }

        let rl_timeout = remaining(overall_deadline);
        if rl_timeout.is_zero() {
            return Err(FailReason::InfraDeadline);
        }
        self.rate_limiter.acquire(host, self.gate.is_slow(host), rl_timeout).await?;

        let proxy = match proxy_override {
            Some(p) => p,
            None => match self.proxy_pool.borrow() {
                Some(p) => p,
                None => return Err(FailReason::ProxyConnection),
            },
        };

        let attempt_budget = self.fetcher.read_timeout(strategy).min(remaining(overall_deadline));
        if attempt_budget.is_zero() {
            return Err(FailReason::InfraDeadline);
        }

        let fetch_fut = self.fetcher.fetch(
            url,
            &proxy.endpoint,
            strategy,
            attempt_budget,
            host,
            &self.soft_404_cache,
            false,
            false,
        );

        let outer_budget = remaining(overall_deadline);
        let result = match tokio::time::timeout(outer_budget, fetch_fut).await {
            Err(_) => {
                // Company deadline raced past the in-flight fetch. The
                // proxy outcome is a cancellation, not a failure: it must
                // not degrade weighting or breaker counting, but the
                // caller still sees a deadline failure.
                self.proxy_pool.report(&proxy, false, Some(FailReason::InfraCancelled));
                drop(lease);
                return Err(FailReason::InfraDeadline);
            }
            Ok(outcome) => outcome,
        };

        drop(lease);

        match result {
            empresa_core::FetchOutcome::Ok { bytes, http_status, final_url, elapsed_ms, .. } => {
                self.proxy_pool.report(&proxy, true, None);
                self.breaker.record_success(host);
                self.latency_tracker.record_and_maybe_flag(host, elapsed_ms, &self.gate);
                Ok((bytes, http_status, final_url, elapsed_ms, proxy))
            }
            empresa_core::FetchOutcome::Fail { reason, elapsed_ms } => {
                self.proxy_pool.report(&proxy, false, Some(reason));
                if reason.counts_against_proxy() {
                    self.breaker.record_failure(host);
                }
                self.latency_tracker.record_and_maybe_flag(host, elapsed_ms, &self.gate);
                Err(reason)
            }
        }
    }

    pub fn borrow_proxy(&self) -> Option<Arc<Proxy>> {
        self.proxy_pool.borrow()
    }
}
