//! Thread-safe counters, latency histograms and the batch-status snapshot.
//! Readers never block writers: every counter is an atomic or a
//! short-lived-lock `DashMap` entry, and `snapshot()` produces an
//! immutable value the caller can serialize at will.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use empresa_core::FailReason;
use rand::Rng;
use serde::Serialize;

/// Reservoir-sampled latency histogram. Bounded memory regardless of how
/// many observations are fed in; the reservoir's distribution
/// approximates the true one once it fills.
pub struct LatencyHistogram {
    capacity: usize,
    samples: Mutex<Vec<u64>>,
    seen: AtomicU64,
    sum_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyHistogram {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Mutex::new(Vec::with_capacity(capacity)),
            seen: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    pub fn record(&self, elapsed_ms: u64) {
        self.sum_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.min_ms.fetch_min(elapsed_ms, Ordering::Relaxed);
        self.max_ms.fetch_max(elapsed_ms, Ordering::Relaxed);
        let n = self.seen.fetch_add(1, Ordering::Relaxed);

        let mut samples = self.samples.lock().unwrap();
        if samples.len() < self.capacity {
            samples.push(elapsed_ms);
        } else {
            let j = rand::thread_rng().gen_range(0..=n) as usize;
            if j < self.capacity {
                samples[j] = elapsed_ms;
            }
        }
    }

    pub fn snapshot(&self) -> ProcessingTimeStats {
        let seen = self.seen.load(Ordering::Relaxed);
        if seen == 0 {
            return ProcessingTimeStats::default();
        }
        let sum = self.sum_ms.load(Ordering::Relaxed) as f64;
        let avg = sum / seen as f64;
        let min = self.min_ms.load(Ordering::Relaxed);
        let max = self.max_ms.load(Ordering::Relaxed);

        let mut sorted = self.samples.lock().unwrap().clone();
        sorted.sort_unstable();

        let pct = |p: f64| -> u64 {
            if sorted.is_empty() {
                return 0;
            }
            let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };

        ProcessingTimeStats {
            avg,
            min,
            max,
            p50: pct(50.0),
            p60: pct(60.0),
            p70: pct(70.0),
            p80: pct(80.0),
            p90: pct(90.0),
            p95: pct(95.0),
            p99: pct(99.0),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingTimeStats {
    pub avg: f64,
    pub min: u64,
    pub max: u64,
    pub p50: u64,
    pub p60: u64,
    pub p70: u64,
    pub p80: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Sliding 60-second throughput counter: every completion is timestamped,
/// stale entries older than the window are pruned lazily on read.
struct Throughput {
    window: Duration,
    completions: Mutex<Vec<Instant>>,
}

impl Throughput {
    fn new() -> Self {
        Self {
            window: Duration::from_secs(60),
            completions: Mutex::new(Vec::new()),
        }
    }

    fn record(&self) {
        let now = Instant::now();
        let mut v = self.completions.lock().unwrap();
        v.push(now);
        let window = self.window;
        v.retain(|t| now.duration_since(*t) <= window);
    }

    fn per_min(&self) -> u64 {
        let now = Instant::now();
        let window = self.window;
        let mut v = self.completions.lock().unwrap();
        v.retain(|t| now.duration_since(*t) <= window);
        v.len() as u64
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubpagePipelineStats {
    pub links_in_html_total: u64,
    pub links_after_filter: u64,
    pub links_selected: u64,
    pub links_per_company_avg: f64,
    pub selected_per_company_avg: f64,
    pub zero_links_companies: u64,
    pub zero_links_pct: f64,
    pub main_page_failures: u64,
    pub main_page_fail_reasons: HashMap<String, u64>,
    pub subpages_attempted: u64,
    pub subpages_ok: u64,
    pub subpages_failed: u64,
    pub subpage_success_rate_pct: f64,
    pub subpage_error_breakdown: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub id: String,
    pub url: String,
    pub error: String,
    pub time: String,
}

/// The stable status-object shape, minus the fields (`batch_id`,
/// `status`, `elapsed_seconds`, `instances`) that only the batch driver
/// can supply.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FabricSnapshot {
    pub total: u64,
    pub processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub success_rate_pct: f64,
    pub remaining: u64,
    pub in_progress: u64,
    pub peak_in_progress: u64,
    pub throughput_per_min: u64,
    pub processing_time_ms: ProcessingTimeStats,
    pub error_breakdown: HashMap<String, u64>,
    pub pages_per_company_avg: f64,
    pub total_retries: u64,
    pub subpage_pipeline: SubpagePipelineStats,
    pub last_errors: Vec<LastError>,
}

const MAX_LAST_ERRORS: usize = 25;

/// All fabric-level counters for one batch. Constructed fresh per batch,
/// the same one-context-per-run discipline `ScrapeContext` uses one
/// level down.
pub struct MetricsRegistry {
    total: AtomicU64,
    processed: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    in_progress: AtomicU64,
    peak_in_progress: AtomicU64,
    total_retries: AtomicU64,
    total_pages: AtomicU64,
    throughput: Throughput,
    processing_time: LatencyHistogram,
    error_breakdown: DashMap<String, AtomicU64>,
    last_errors: Mutex<Vec<LastError>>,

    links_in_html_total: AtomicU64,
    links_after_filter: AtomicU64,
    links_selected: AtomicU64,
    zero_links_companies: AtomicU64,
    companies_with_links: AtomicU64,
    main_page_failures: AtomicU64,
    main_page_fail_reasons: DashMap<String, AtomicU64>,
    subpages_attempted: AtomicU64,
    subpages_ok: AtomicU64,
    subpages_failed: AtomicU64,
    subpage_error_breakdown: DashMap<String, AtomicU64>,
}

impl MetricsRegistry {
    pub fn new(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            processed: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            in_progress: AtomicU64::new(0),
            peak_in_progress: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            total_pages: AtomicU64::new(0),
            throughput: Throughput::new(),
            processing_time: LatencyHistogram::new(4096),
            error_breakdown: DashMap::new(),
            last_errors: Mutex::new(Vec::new()),
            links_in_html_total: AtomicU64::new(0),
            links_after_filter: AtomicU64::new(0),
            links_selected: AtomicU64::new(0),
            zero_links_companies: AtomicU64::new(0),
            companies_with_links: AtomicU64::new(0),
            main_page_failures: AtomicU64::new(0),
            main_page_fail_reasons: DashMap::new(),
            subpages_attempted: AtomicU64::new(0),
            subpages_ok: AtomicU64::new(0),
            subpages_failed: AtomicU64::new(0),
            subpage_error_breakdown: DashMap::new(),
        }
    }

    pub fn company_started(&self) {
        let n = self.in_progress.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_progress.fetch_max(n, Ordering::Relaxed);
    }

    pub fn retry_recorded(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the completion of one company: success/failure, elapsed
    /// time, pages produced, and (on failure) the taxonomised reason.
    #[allow(clippy::too_many_arguments)]
    pub fn company_finished(
        &self,
        company_id: &str,
        url: &str,
        ok: bool,
        elapsed_ms: u64,
        pages: usize,
        reason: Option<FailReason>,
    ) {
        self.in_progress.fetch_sub(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_pages.fetch_add(pages as u64, Ordering::Relaxed);
        self.processing_time.record(elapsed_ms);
        self.throughput.record();

        if ok {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            self.main_page_failures.fetch_add(1, Ordering::Relaxed);
            if let Some(reason) = reason {
                let key = reason.as_key().to_string();
                self.error_breakdown
                    .entry(key.clone())
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
                self.main_page_fail_reasons
                    .entry(key.clone())
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);

                let mut errors = self.last_errors.lock().unwrap();
                errors.push(LastError {
                    id: company_id.to_string(),
                    url: url.to_string(),
                    error: key,
                    time: format!("{elapsed_ms}ms"),
                });
                if errors.len() > MAX_LAST_ERRORS {
                    let excess = errors.len() - MAX_LAST_ERRORS;
                    errors.drain(0..excess);
                }
            }
        }
    }

    pub fn links_observed(&self, raw: u32, filtered: u32, selected: u32) {
        self.links_in_html_total.fetch_add(raw as u64, Ordering::Relaxed);
        self.links_after_filter.fetch_add(filtered as u64, Ordering::Relaxed);
        self.links_selected.fetch_add(selected as u64, Ordering::Relaxed);
        self.companies_with_links.fetch_add(1, Ordering::Relaxed);
        if filtered == 0 {
            self.zero_links_companies.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subpage_attempted(&self) {
        self.subpages_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subpage_finished(&self, ok: bool, reason: Option<FailReason>) {
        if ok {
            self.subpages_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.subpages_failed.fetch_add(1, Ordering::Relaxed);
            if let Some(reason) = reason {
                self.subpage_error_breakdown
                    .entry(reason.as_key().to_string())
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn map_to_hashmap(m: &DashMap<String, AtomicU64>) -> HashMap<String, u64> {
        m.iter().map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed))).collect()
    }

    pub fn snapshot(&self) -> FabricSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        let success = self.success_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        let companies_with_links = self.companies_with_links.load(Ordering::Relaxed).max(1);
        let subpages_attempted = self.subpages_attempted.load(Ordering::Relaxed);
        let subpages_ok = self.subpages_ok.load(Ordering::Relaxed);
        let subpages_failed = self.subpages_failed.load(Ordering::Relaxed);

        FabricSnapshot {
            total,
            processed,
            success_count: success,
            error_count: errors,
            success_rate_pct: if processed == 0 { 0.0 } else { success as f64 / processed as f64 * 100.0 },
            remaining: total.saturating_sub(processed),
            in_progress: self.in_progress.load(Ordering::Relaxed),
            peak_in_progress: self.peak_in_progress.load(Ordering::Relaxed),
            throughput_per_min: self.throughput.per_min(),
            processing_time_ms: self.processing_time.snapshot(),
            error_breakdown: Self::map_to_hashmap(&self.error_breakdown),
            pages_per_company_avg: if processed == 0 {
                0.0
            } else {
                self.total_pages.load(Ordering::Relaxed) as f64 / processed as f64
            },
            total_retries: self.total_retries.load(Ordering::Relaxed),
            subpage_pipeline: SubpagePipelineStats {
                links_in_html_total: self.links_in_html_total.load(Ordering::Relaxed),
                links_after_filter: self.links_after_filter.load(Ordering::Relaxed),
                links_selected: self.links_selected.load(Ordering::Relaxed),
                links_per_company_avg: self.links_after_filter.load(Ordering::Relaxed) as f64 / companies_with_links as f64,
                selected_per_company_avg: self.links_selected.load(Ordering::Relaxed) as f64 / companies_with_links as f64,
                zero_links_companies: self.zero_links_companies.load(Ordering::Relaxed),
                zero_links_pct: self.zero_links_companies.load(Ordering::Relaxed) as f64 / companies_with_links as f64 * 100.0,
                main_page_failures: self.main_page_failures.load(Ordering::Relaxed),
                main_page_fail_reasons: Self::map_to_hashmap(&self.main_page_fail_reasons),
                subpages_attempted,
                subpages_ok,
                subpages_failed,
                subpage_success_rate_pct: if subpages_attempted == 0 {
                    0.0
                } else {
                    subpages_ok as f64 / subpages_attempted as f64 * 100.0
                },
                subpage_error_breakdown: Self::map_to_hashmap(&self.subpage_error_breakdown),
            },
            last_errors: self.last_errors.lock().unwrap().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_reports_sensible_percentiles_for_uniform_samples() {
        let hist = LatencyHistogram::new(4096);
        for ms in 1..=1000u64 {
            hist.record(ms);
        }
        let stats = hist.snapshot();
        assert!(stats.p50 > 400 && stats.p50 < 600, "p50={}", stats.p50);
        assert!(stats.p99 > 950, "p99={}", stats.p99);
        assert_eq!(stats.min, 1);
        assert_eq!(stats.max, 1000);
    }

    #[test]
    fn company_finished_updates_success_and_error_counts() {
        let m = MetricsRegistry::new(10);
        m.company_started();
        m.company_finished("c1", "https://a.com", true, 120, 6, None);
        m.company_started();
        m.company_finished("c2", "https://b.com", false, 90, 0, Some(FailReason::ProbeTimeout));

        let snap = m.snapshot();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.error_breakdown.get("probe:timeout"), Some(&1));
        assert_eq!(snap.last_errors.len(), 1);
    }

    #[test]
    fn zero_links_pct_counts_against_companies_with_links_observed() {
        let m = MetricsRegistry::new(2);
        m.links_observed(0, 0, 0);
        m.links_observed(9, 5, 3);
        let snap = m.snapshot();
        assert_eq!(snap.subpage_pipeline.zero_links_companies, 1);
        assert!((snap.subpage_pipeline.zero_links_pct - 50.0).abs() < 0.01);
    }
}
