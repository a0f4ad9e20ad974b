//! Classifies protection and static-vs-SPA from the probe response,
//! and the pure `SiteProfile -> [Strategy]` mapping.

use std::collections::HashMap;

use empresa_core::{Protection, SiteKind, SiteProfile};
use empresa_fetcher::Strategy;

/// Multilingual captcha/challenge keywords, following the substring-set
/// idiom used for waiting-screen and form detection.
const CAPTCHA_KEYWORDS: &[&str] = &[
    "captcha", "recaptcha", "hcaptcha", "are you human", "verifique que você é humano",
    "prove you are human", "cloudflare challenge",
];

const WAF_KEYWORDS: &[&str] = &["access denied", "web application firewall", "request blocked", "security check"];

const RATE_LIMIT_KEYWORDS: &[&str] = &["too many requests", "rate limit exceeded", "slow down"];

/// Examines response headers and up to ~32 KB of HTML body to classify
/// protection and static/SPA kind. Performs no network I/O.
pub struct SiteAnalyzer;

impl SiteAnalyzer {
    pub fn analyze(
        headers: &HashMap<String, String>,
        body: &str,
        latency_ms: u64,
        canonical_url: &str,
    ) -> SiteProfile {
        const HEAD_CAP: usize = 32 * 1024;
        let head: String = body.chars().take(HEAD_CAP).collect();
        let lower = head.to_lowercase();

        let protection = classify_protection(headers, &lower);
        let kind = classify_kind(&head);

        SiteProfile {
            reachable: true,
            protection,
            kind,
            latency_ms,
            canonical_url: canonical_url.to_string(),
            cached_html: Some(head),
            known_soft_404_exempt: false,
        }
    }
}

fn classify_protection(headers: &HashMap<String, String>, lower_body: &str) -> Protection {
    let server = headers
        .get("server")
        .map(|s| s.to_lowercase())
        .unwrap_or_default();
    let has_cf_ray = headers.contains_key("cf-ray");

    if has_cf_ray || server.contains("cloudflare") {
        return Protection::Cloudflare;
    }
    if CAPTCHA_KEYWORDS.iter().any(|k| lower_body.contains(k)) {
        return Protection::Captcha;
    }
    if WAF_KEYWORDS.iter().any(|k| lower_body.contains(k)) {
        return Protection::Waf;
    }
    if RATE_LIMIT_KEYWORDS.iter().any(|k| lower_body.contains(k)) {
        return Protection::RateLimit;
    }
    Protection::None
}

fn classify_kind(head: &str) -> SiteKind {
    let lower = head.to_lowercase();
    let body_start = lower.find("<body").unwrap_or(0);
    let body_slice = &lower[body_start..];
    let visible_text_len: usize = body_slice
        .split(|c| c == '<' || c == '>')
        .filter(|s| !s.trim().is_empty() && !s.contains("script") && !s.contains("style"))
        .map(|s| s.trim().len())
        .sum();
    let script_count = lower.matches("<script").count();

    if visible_text_len < 200 && script_count >= 3 {
        SiteKind::Spa
    } else if script_count >= 8 {
        SiteKind::Hybrid
    } else {
        SiteKind::Static
    }
}

/// Pure function mapping a `SiteProfile` to an ordered fallback list of
/// fetch strategies.
pub fn select_strategies(profile: &SiteProfile) -> Vec<Strategy> {
    match (profile.protection, profile.kind) {
        (Protection::None, SiteKind::Static) => vec![Strategy::Fast, Strategy::Standard],
        (Protection::None, SiteKind::Spa) | (Protection::None, SiteKind::Hybrid) => {
            vec![Strategy::Standard, Strategy::Robust]
        }
        (Protection::Cloudflare, _) => vec![Strategy::Aggressive, Strategy::Robust],
        (Protection::Waf, _) | (Protection::Captcha, _) => vec![Strategy::Aggressive],
        (Protection::RateLimit, _) => vec![Strategy::Robust],
        (Protection::Unknown, _) => vec![Strategy::Standard, Strategy::Robust],
    }
}

/// Strategies for which exhausting the list is expected to be terminal
/// rather than transient.
pub fn is_likely_terminal(profile: &SiteProfile) -> bool {
    matches!(profile.protection, Protection::Waf | Protection::Captcha)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(protection: Protection, kind: SiteKind) -> SiteProfile {
        SiteProfile {
            reachable: true,
            protection,
            kind,
            latency_ms: 100,
            canonical_url: "https://example.com".into(),
            cached_html: None,
            known_soft_404_exempt: false,
        }
    }

    #[test]
    fn static_clean_site_prefers_fast_then_standard() {
        let s = select_strategies(&profile(Protection::None, SiteKind::Static));
        assert_eq!(s, vec![Strategy::Fast, Strategy::Standard]);
    }

    #[test]
    fn cloudflare_prefers_aggressive() {
        let s = select_strategies(&profile(Protection::Cloudflare, SiteKind::Static));
        assert_eq!(s, vec![Strategy::Aggressive, Strategy::Robust]);
    }

    #[test]
    fn waf_is_aggressive_only_and_terminal() {
        let p = profile(Protection::Waf, SiteKind::Static);
        assert_eq!(select_strategies(&p), vec![Strategy::Aggressive]);
        assert!(is_likely_terminal(&p));
    }

    #[test]
    fn cloudflare_header_triggers_classification() {
        let mut headers = HashMap::new();
        headers.insert("cf-ray".to_string(), "abc123".to_string());
        let profile = SiteAnalyzer::analyze(&headers, "<html><body>hi</body></html>", 50, "https://x.com");
        assert_eq!(profile.protection, Protection::Cloudflare);
    }

    #[test]
    fn sparse_scripted_body_is_spa() {
        let headers = HashMap::new();
        let body = "<html><body><div id=\"app\"></div>\
            <script src=\"a\"></script><script src=\"b\"></script><script src=\"c\"></script></body></html>";
        let profile = SiteAnalyzer::analyze(&headers, body, 50, "https://x.com");
        assert_eq!(profile.kind, SiteKind::Spa);
    }
}
