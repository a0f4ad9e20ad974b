//! Single `(url, proxy, strategy)` → `FetchOutcome` primitive; classifies
//! outcomes into the failure taxonomy.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use empresa_core::{FailReason, FetchOutcome};
use rand::seq::SliceRandom;
use rquest_util::Emulation;
use sha2::{Digest, Sha256};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Fast,
    Standard,
    Robust,
    Aggressive,
}

impl Strategy {
    /// Read-timeout deadline, derived from the deployment's configured
    /// fast/slow ceilings. Fast uses the fast ceiling directly; Robust
    /// sits at the slow ceiling; Standard splits the difference;
    /// Aggressive runs past the slow ceiling since it expects retries
    /// behind protection.
    pub fn read_timeout(&self, fast_ms: u64, slow_ms: u64) -> Duration {
        let ms = match self {
            Strategy::Fast => fast_ms,
            Strategy::Standard => fast_ms + slow_ms.saturating_sub(fast_ms) / 2,
            Strategy::Robust => slow_ms,
            Strategy::Aggressive => slow_ms + slow_ms / 4,
        };
        Duration::from_millis(ms)
    }

    /// Connect deadline, kept at two-thirds of the read deadline so a dead
    /// proxy is abandoned well before the strategy's overall budget runs out.
    pub fn connect_timeout(&self, fast_ms: u64, slow_ms: u64) -> Duration {
        let read_ms = self.read_timeout(fast_ms, slow_ms).as_millis() as u64;
        Duration::from_millis(read_ms * 2 / 3)
    }

    pub fn rotates_user_agent(&self) -> bool {
        matches!(self, Strategy::Aggressive)
    }
}

/// At least ten user agents, rotated on top of the TLS emulation profile
/// for the AGGRESSIVE strategy.
const USER_AGENT_POOL: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 Version/17.4 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Android 14; Mobile; rv:125.0) Gecko/125.0 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 6.1; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_14_6) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edg/124.0 Safari/537.36",
    "Mozilla/5.0 (iPad; CPU OS 17_4 like Mac OS X) AppleWebKit/605.1.15 Version/17.4 Mobile/15E148 Safari/604.1",
];

const STABLE_USER_AGENT: &str = USER_AGENT_POOL[0];

const SOFT_404_SUBSTRINGS: &[&str] = &[
    "not found",
    "página não encontrada",
    "pagina nao encontrada",
    "página não existe",
    "not-found",
    "404 error",
];

fn hash_body(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("{digest:x}")
}

/// Caches each host's previously-observed canonical 404 body hash, used as
/// the third soft-404 signal (identity with a cached 404 page).
#[derive(Default)]
pub struct Soft404Cache {
    by_host: Mutex<HashMap<String, String>>,
}

impl Soft404Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, host: &str, body: &[u8]) {
        self.by_host
            .lock()
            .unwrap()
            .insert(host.to_string(), hash_body(body));
    }

    pub fn matches(&self, host: &str, body: &[u8]) -> bool {
        self.by_host
            .lock()
            .unwrap()
            .get(host)
            .is_some_and(|h| h == &hash_body(body))
    }
}

/// Three-signal soft-404 heuristic: body under 500 bytes, a "not found"
/// substring, or identity with a cached canonical 404 for the host.
/// `exempt` is the per-host escape hatch — a caller sets it when this
/// heuristic is known to misfire for a legitimate page on this host.
pub fn is_soft_404(body: &[u8], host: &str, cache: &Soft404Cache, exempt: bool) -> bool {
    if exempt {
        return false;
    }
    if body.len() < 500 {
        return true;
    }
    let lower = String::from_utf8_lossy(body).to_lowercase();
    if SOFT_404_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
        return true;
    }
    cache.matches(host, body)
}

/// An `rquest::Client` is built once per `(strategy, proxy endpoint)` pair
/// and cached, since each carries its own proxy and timeout settings and
/// building a TLS-capable client is comparatively expensive. Every client
/// emulates Firefox's TLS ClientHello via `rquest-util` rather than
/// presenting the generic rustls fingerprint a plain HTTP client would.
pub struct HttpFetcher {
    clients: DashMap<(Strategy, String), rquest::Client>,
    fetch_timeout_ms_fast: u64,
    fetch_timeout_ms_slow: u64,
}

impl HttpFetcher {
    pub fn new(fetch_timeout_ms_fast: u64, fetch_timeout_ms_slow: u64) -> Self {
        Self {
            clients: DashMap::new(),
            fetch_timeout_ms_fast,
            fetch_timeout_ms_slow,
        }
    }

    /// The read-timeout deadline a caller should budget for this strategy,
    /// derived from this fetcher's configured fast/slow ceilings.
    pub fn read_timeout(&self, strategy: Strategy) -> Duration {
        strategy.read_timeout(self.fetch_timeout_ms_fast, self.fetch_timeout_ms_slow)
    }

    fn client_for(&self, strategy: Strategy, proxy_endpoint: &str) -> Result<rquest::Client, ()> {
        if let Some(c) = self.clients.get(&(strategy, proxy_endpoint.to_string())) {
            return Ok(c.clone());
        }
        let proxy = rquest::Proxy::all(proxy_endpoint).map_err(|_| ())?;
        let client = rquest::Client::builder()
            .emulation(Emulation::Firefox128)
            .proxy(proxy)
            .connect_timeout(strategy.connect_timeout(self.fetch_timeout_ms_fast, self.fetch_timeout_ms_slow))
            .timeout(strategy.read_timeout(self.fetch_timeout_ms_fast, self.fetch_timeout_ms_slow))
            .redirect(rquest::redirect::Policy::limited(5))
            .build()
            .map_err(|_| ())?;
        self.clients
            .insert((strategy, proxy_endpoint.to_string()), client.clone());
        Ok(client)
    }

    fn user_agent(&self, strategy: Strategy) -> &'static str {
        if strategy.rotates_user_agent() {
            USER_AGENT_POOL
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(STABLE_USER_AGENT)
        } else {
            STABLE_USER_AGENT
        }
    }

    /// Performs one fetch attempt. Does not retry — retry-with-fresh-proxy
    /// is the orchestrator's responsibility.
    pub async fn fetch(
        &self,
        url: &str,
        proxy_endpoint: &str,
        strategy: Strategy,
        deadline: Duration,
        host: &str,
        soft_404_cache: &Soft404Cache,
        soft_404_exempt: bool,
        from_prober: bool,
    ) -> FetchOutcome {
        let start = Instant::now();

        let req_client = match self.client_for(strategy, proxy_endpoint) {
            Ok(c) => c,
            Err(()) => {
                return FetchOutcome::Fail {
                    reason: FailReason::ProxyConnection,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                };
            }
        };

        let result = tokio::time::timeout(
            deadline,
            req_client
                .get(url)
                .header("User-Agent", self.user_agent(strategy))
                .send(),
        )
        .await;

        let result = match result {
            Ok(r) => r,
            Err(_) => {
                let reason = if from_prober {
                    FailReason::ProbeTimeout
                } else {
                    FailReason::ProxyTimeout
                };
                return FetchOutcome::Fail {
                    reason,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                };
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                let reason = classify_transport_error(&e, from_prober);
                debug!(url, ?reason, "fetch transport error");
                return FetchOutcome::Fail { reason, elapsed_ms };
            }
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
            .collect();

        if let Some(reason) = classify_http_status(status) {
            return FetchOutcome::Fail { reason, elapsed_ms };
        }

        let bytes = match response.bytes().await {
            Ok(b) => b.to_vec(),
            Err(_) => {
                return FetchOutcome::Fail {
                    reason: FailReason::ProxyTimeout,
                    elapsed_ms,
                }
            }
        };

        if bytes.is_empty() {
            return FetchOutcome::Fail {
                reason: FailReason::ProxyEmptyResponse,
                elapsed_ms,
            };
        }

        if is_soft_404(&bytes, host, soft_404_cache, soft_404_exempt) {
            soft_404_cache.remember(host, &bytes);
            return FetchOutcome::Fail {
                reason: FailReason::ProxyEmptyResponse,
                elapsed_ms,
            };
        }

        FetchOutcome::Ok {
            bytes,
            http_status: status,
            final_url,
            elapsed_ms,
            headers,
        }
    }
}

fn classify_http_status(status: u16) -> Option<FailReason> {
    match status {
        200..=399 => None,
        403 => Some(FailReason::ProxyHttp403),
        429 => Some(FailReason::ProxyHttp429),
        500..=599 => Some(FailReason::ProxyHttp5xx),
        _ => Some(FailReason::ProxyOther),
    }
}

fn classify_transport_error(err: &rquest::Error, from_prober: bool) -> FailReason {
    if err.is_timeout() {
        return if from_prober {
            FailReason::ProbeTimeout
        } else {
            FailReason::ProxyTimeout
        };
    }
    let msg = err.to_string().to_lowercase();
    if msg.contains("tls") || msg.contains("certificate") || msg.contains("ssl") {
        return if from_prober {
            FailReason::ProbeSsl
        } else {
            FailReason::ProxyConnection
        };
    }
    if from_prober {
        FailReason::ProbeUnknown
    } else {
        FailReason::ProxyConnection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_body_is_soft_404() {
        let cache = Soft404Cache::new();
        assert!(is_soft_404(b"tiny", "a.com", &cache, false));
    }

    #[test]
    fn substring_match_is_soft_404() {
        let cache = Soft404Cache::new();
        let body = "x".repeat(600) + "pagina nao encontrada";
        assert!(is_soft_404(body.as_bytes(), "a.com", &cache, false));
    }

    #[test]
    fn exempt_host_bypasses_heuristic() {
        let cache = Soft404Cache::new();
        assert!(!is_soft_404(b"tiny", "a.com", &cache, true));
    }

    #[test]
    fn cached_identity_flags_repeat_404_body() {
        let cache = Soft404Cache::new();
        let body = "y".repeat(600);
        cache.remember("a.com", body.as_bytes());
        assert!(is_soft_404(body.as_bytes(), "a.com", &cache, false));
    }

    #[test]
    fn http_status_classification_matches_taxonomy() {
        assert_eq!(classify_http_status(200), None);
        assert_eq!(classify_http_status(403), Some(FailReason::ProxyHttp403));
        assert_eq!(classify_http_status(429), Some(FailReason::ProxyHttp429));
        assert_eq!(classify_http_status(503), Some(FailReason::ProxyHttp5xx));
    }
}
