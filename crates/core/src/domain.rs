use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::taxonomy::FailReason;

/// A proxy endpoint with monotonic outcome counters. Identity never
/// mutates; counters only grow for the lifetime of the process.
#[derive(Debug)]
pub struct Proxy {
    pub id: u32,
    pub endpoint: String,
    allocations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    discarded: AtomicBool,
}

impl Proxy {
    pub fn new(id: u32, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            allocations: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            discarded: AtomicBool::new(false),
        }
    }

    pub fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an observed outcome. `infra:cancelled` must never reach
    /// here — callers filter it out before calling `report`.
    pub fn record_outcome(&self, ok: bool) {
        if ok {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn mark_discarded(&self) {
        self.discarded.store(true, Ordering::Relaxed);
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn observations(&self) -> u64 {
        self.successes() + self.failures()
    }

    pub fn success_rate(&self) -> f64 {
        let obs = self.observations();
        if obs == 0 {
            0.0
        } else {
            self.successes() as f64 / obs as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protection {
    None,
    Cloudflare,
    Waf,
    Captcha,
    RateLimit,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteKind {
    Static,
    Spa,
    Hybrid,
}

/// Result of probing a single company URL.
#[derive(Debug, Clone)]
pub struct SiteProfile {
    pub reachable: bool,
    pub protection: Protection,
    pub kind: SiteKind,
    pub latency_ms: u64,
    pub canonical_url: String,
    pub cached_html: Option<String>,
    /// Escape hatch for the soft-404 heuristic: set by a caller who knows
    /// this host's "not found" pages legitimately look like the
    /// heuristic's signature.
    pub known_soft_404_exempt: bool,
}

/// Result of a single `(url, proxy, strategy)` attempt.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Ok {
        bytes: Vec<u8>,
        http_status: u16,
        final_url: String,
        elapsed_ms: u64,
        headers: HashMap<String, String>,
    },
    Fail {
        reason: FailReason,
        elapsed_ms: u64,
    },
}

impl FetchOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, FetchOutcome::Ok { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// One item in a batch.
#[derive(Debug, Clone)]
pub struct CompanyWork {
    pub registration_id: String,
    pub candidate_url: Option<String>,
    pub trade_name: Option<String>,
    pub city: Option<String>,
}

/// Per-subpage-pipeline counters attached to a `ScrapeResult`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubpageStats {
    pub attempted: u32,
    pub ok: u32,
    pub failed: u32,
    pub reason_histogram: HashMap<String, u32>,
}

/// One fetched page kept in a `ScrapeResult`.
#[derive(Debug, Clone)]
pub struct PageText {
    pub url: String,
    pub text: String,
    pub bytes: usize,
}

/// Returned by the Orchestrator for one company.
#[derive(Debug, Clone, Default)]
pub struct ScrapeResult {
    pub pages: Vec<PageText>,
    pub main_page_fail_reason: Option<FailReason>,
    pub subpage_stats: SubpageStats,
    pub links_seen: u32,
    pub links_selected: u32,
}

impl Default for PageText {
    fn default() -> Self {
        PageText {
            url: String::new(),
            text: String::new(),
            bytes: 0,
        }
    }
}

impl ScrapeResult {
    /// Exactly one of `{pages non-empty, main_page_fail_reason is set}`
    /// holds.
    pub fn is_consistent(&self) -> bool {
        !self.pages.is_empty() != self.main_page_fail_reason.is_some()
    }
}
