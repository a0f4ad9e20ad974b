use serde::Deserialize;

/// The full configuration bundle. Loaded once at startup and treated as
/// immutable for the process lifetime.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub gate: GateConfig,
    pub rate_limiter: RateLimiterConfig,
    pub breaker: BreakerConfig,
    pub fetcher: FetcherConfig,
    pub orchestrator: OrchestratorConfig,
    pub proxy_pool: ProxyPoolConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GateConfig {
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
    #[serde(default = "default_per_domain_limit")]
    pub per_domain_limit: usize,
    #[serde(default = "default_slow_domain_limit")]
    pub slow_domain_limit: usize,
    #[serde(default = "default_slow_p95_ms")]
    pub slow_p95_threshold_ms: u64,
}

fn default_global_concurrency() -> usize {
    200
}
fn default_per_domain_limit() -> usize {
    5
}
fn default_slow_domain_limit() -> usize {
    2
}
fn default_slow_p95_ms() -> u64 {
    8000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimiterConfig {
    #[serde(default = "default_rpm_default")]
    pub rpm_default: u32,
    #[serde(default = "default_rpm_slow")]
    pub rpm_slow: u32,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

fn default_rpm_default() -> u32 {
    300
}
fn default_rpm_slow() -> u32 {
    60
}
fn default_burst_size() -> u32 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_recovery_ms")]
    pub breaker_recovery_ms: u64,
    #[serde(default = "default_breaker_half_open_max")]
    pub breaker_half_open_max: u32,
}

fn default_breaker_threshold() -> u32 {
    12
}
fn default_breaker_recovery_ms() -> u64 {
    30_000
}
fn default_breaker_half_open_max() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_fetch_timeout_ms_fast")]
    pub fetch_timeout_ms_fast: u64,
    #[serde(default = "default_fetch_timeout_ms_slow")]
    pub fetch_timeout_ms_slow: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}
fn default_fetch_timeout_ms_fast() -> u64 {
    12_000
}
fn default_fetch_timeout_ms_slow() -> u64 {
    15_000
}
fn default_max_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub intra_batch_delay_ms: u64,
    #[serde(default)]
    pub inter_batch_delay_ms: u64,
    #[serde(default = "default_rescue_min_chars")]
    pub rescue_min_chars: usize,
    #[serde(default = "default_max_subpages")]
    pub max_subpages: usize,
    #[serde(default = "default_company_deadline_ms")]
    pub company_deadline_ms: u64,
}

fn default_batch_size() -> usize {
    4
}
fn default_rescue_min_chars() -> usize {
    500
}
fn default_max_subpages() -> usize {
    5
}
fn default_company_deadline_ms() -> u64 {
    90_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyPoolConfig {
    #[serde(default = "default_proxy_min_success_rate")]
    pub proxy_min_success_rate: f64,
    #[serde(default = "default_proxy_min_observations")]
    pub proxy_min_observations: u64,
}

fn default_proxy_min_success_rate() -> f64 {
    0.10
}
fn default_proxy_min_observations() -> u64 {
    8
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
