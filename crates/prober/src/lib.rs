//! Tries the four `{http,https}×{www,apex}` variants of a company URL in
//! parallel and returns the first that produces an exploitable response.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use empresa_core::taxonomy::{as_probe_reason, probe_failure_severity};
use empresa_core::{FailReason, FetchOutcome, Protection, SiteKind, SiteProfile};
use empresa_fetcher::{HttpFetcher, Soft404Cache, Strategy};
use tokio::task::JoinSet;
use url::Url;
use tracing::debug;

#[derive(Debug)]
pub struct ProbeFail {
    pub reason: FailReason,
}

/// The winning variant's canonical URL, a preliminary `SiteProfile`, and
/// the response headers — threaded through so the Site Analyzer can do
/// its authoritative classification without any extra network I/O.
pub struct ProbeSuccess {
    pub canonical_url: String,
    pub profile: SiteProfile,
    pub headers: HashMap<String, String>,
}

/// Builds the four canonical variants of a raw company URL, preserving
/// the original path/query. Returns `None` if the input has no parseable
/// host.
pub fn variants(raw_url: &str) -> Option<Vec<Url>> {
    let normalized = if raw_url.contains("://") {
        raw_url.to_string()
    } else {
        format!("https://{raw_url}")
    };
    let base = Url::parse(&normalized).ok()?;
    let host = base.host_str()?.to_string();
    let apex = host.strip_prefix("www.").unwrap_or(&host).to_string();
    let www = format!("www.{apex}");

    let mut out = Vec::with_capacity(4);
    for scheme in ["https", "http"] {
        for host in [&apex, &www] {
            let mut u = base.clone();
            let _ = u.set_scheme(scheme);
            let _ = u.set_host(Some(host));
            out.push(u);
        }
    }
    Some(out)
}

pub struct UrlProber {
    fetcher: std::sync::Arc<HttpFetcher>,
    soft_404_cache: std::sync::Arc<Soft404Cache>,
}

impl UrlProber {
    pub fn new(fetcher: std::sync::Arc<HttpFetcher>, soft_404_cache: std::sync::Arc<Soft404Cache>) -> Self {
        Self { fetcher, soft_404_cache }
    }

    /// Races the four URL variants against one shared deadline. The first
    /// `ok` wins; the rest are aborted. If all four fail, returns the
    /// most-severe reason per the preference order in `probe_failure_severity`.
    pub async fn probe(&self, raw_url: &str, proxy_endpoint: &str, deadline: Duration) -> Result<ProbeSuccess, ProbeFail> {
        let Some(candidates) = variants(raw_url) else {
            return Err(ProbeFail { reason: FailReason::ProbeUnknown });
        };

        let start = Instant::now();
        let mut set = JoinSet::new();
        for url in candidates {
            let fetcher = self.fetcher.clone();
            let cache = self.soft_404_cache.clone();
            let proxy_endpoint = proxy_endpoint.to_string();
            set.spawn(async move {
                let host = url.host_str().unwrap_or_default().to_string();
                let outcome = fetcher
                    .fetch(
                        url.as_str(),
                        &proxy_endpoint,
                        Strategy::Standard,
                        deadline,
                        &host,
                        &cache,
                        false,
                        true,
                    )
                    .await;
                (url, outcome)
            });
        }

        let mut worst: Option<FailReason> = None;
        while let Some(joined) = set.join_next().await {
            let Ok((url, outcome)) = joined else { continue };
            match outcome {
                FetchOutcome::Ok { bytes, elapsed_ms, headers, .. } => {
                    set.abort_all();
                    let text = String::from_utf8_lossy(&bytes);
                    let profile = analyze_probe_body(&text, elapsed_ms);
                    debug!(url = %url, elapsed_ms, "probe succeeded");
                    return Ok(ProbeSuccess {
                        canonical_url: url.to_string(),
                        profile,
                        headers,
                    });
                }
                FetchOutcome::Fail { reason, .. } => {
                    let probe_reason = as_probe_reason(reason);
                    worst = Some(match worst {
                        None => probe_reason,
                        Some(current) => {
                            if probe_failure_severity(probe_reason) > probe_failure_severity(current) {
                                probe_reason
                            } else {
                                current
                            }
                        }
                    });
                }
            }
            if start.elapsed() >= deadline {
                break;
            }
        }

        Err(ProbeFail {
            reason: worst.unwrap_or(FailReason::ProbeUnknown),
        })
    }
}

/// Lightweight protection/kind read used only to seed the profile the
/// Prober hands to the Site Analyzer; the Analyzer does the authoritative
/// classification over the cached body.
fn analyze_probe_body(body: &str, latency_ms: u64) -> SiteProfile {
    let kind = if body.len() < 2000 && body.to_lowercase().contains("<script") {
        SiteKind::Spa
    } else {
        SiteKind::Static
    };
    SiteProfile {
        reachable: true,
        protection: Protection::Unknown,
        kind,
        latency_ms,
        canonical_url: String::new(),
        cached_html: Some(body.to_string()),
        known_soft_404_exempt: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_produces_four_combinations() {
        let v = variants("example.com/about").unwrap();
        assert_eq!(v.len(), 4);
        let schemes: Vec<&str> = v.iter().map(|u| u.scheme()).collect();
        assert!(schemes.contains(&"http"));
        assert!(schemes.contains(&"https"));
        let hosts: Vec<String> = v.iter().map(|u| u.host_str().unwrap().to_string()).collect();
        assert!(hosts.contains(&"example.com".to_string()));
        assert!(hosts.contains(&"www.example.com".to_string()));
    }

    #[test]
    fn variants_strips_existing_www_before_rebuilding() {
        let v = variants("https://www.example.com").unwrap();
        let apex_count = v.iter().filter(|u| u.host_str() == Some("example.com")).count();
        assert_eq!(apex_count, 2);
    }

    #[test]
    fn malformed_input_yields_none() {
        assert!(variants("://///").is_none());
    }
}
