//! Per-company state machine: resolve a candidate URL if none was given,
//! probe, analyze, select strategies, fetch the main page (reusing the
//! prober's body when possible) with retry, rescue a too-thin main page
//! via top-priority subpages, extract and prioritise links, then
//! batch-fetch subpages.

use std::time::{Duration, Instant};

use empresa_analyzer::{select_strategies, SiteAnalyzer};
use empresa_core::{CompanyWork, FailReason, PageText, ScrapeResult, SubpageStats};
use empresa_fetcher::Strategy;
use empresa_links::{extract_links, extract_text, prioritise, registrable_host};
use tracing::{info, warn};
use url::Url;

use crate::context::ScrapeContext;

/// Runs the full per-company pipeline to completion or exhaustion. Never
/// panics on a malformed `CompanyWork`; a missing/unparsable URL is
/// reported as `scrape:error`, not propagated as an error.
pub async fn scrape_company(ctx: &ScrapeContext, work: &CompanyWork) -> ScrapeResult {
    ctx.metrics.company_started();
    let start = Instant::now();
    let deadline = start + Duration::from_millis(ctx.config.orchestrator.company_deadline_ms);

    let result = run(ctx, work, deadline).await;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    ctx.metrics.company_finished(
        &work.registration_id,
        work.candidate_url.as_deref().unwrap_or(""),
        !result.pages.is_empty(),
        elapsed_ms,
        result.pages.len(),
        result.main_page_fail_reason,
    );
    result
}

async fn run(ctx: &ScrapeContext, work: &CompanyWork, deadline: Instant) -> ScrapeResult {
    let resolved_url;
    let raw_url = match work.candidate_url.as_deref() {
        Some(u) => u,
        None => {
            let candidates = ctx
                .candidate_source
                .find_candidates(work.trade_name.as_deref(), work.city.as_deref(), &work.registration_id)
                .await;
            match candidates.into_iter().next() {
                Some(u) => {
                    resolved_url = u.to_string();
                    &resolved_url
                }
                None => {
                    return ScrapeResult {
                        main_page_fail_reason: Some(FailReason::ScrapeError),
                        ..Default::default()
                    };
                }
            }
        }
    };

    let Some(probe_proxy) = ctx.borrow_proxy() else {
        return ScrapeResult {
            main_page_fail_reason: Some(FailReason::ProxyConnection),
            ..Default::default()
        };
    };

    let probe_timeout = Duration::from_millis(ctx.config.fetcher.probe_timeout_ms);
    let probe_result = ctx.prober.probe(raw_url, &probe_proxy.endpoint, probe_timeout).await;

    let probed = match probe_result {
        Ok(p) => {
            ctx.proxy_pool.report(&probe_proxy, true, None);
            p
        }
        Err(fail) => {
            ctx.proxy_pool.report(&probe_proxy, false, None);
            warn!(registration_id = %work.registration_id, reason = %fail.reason, "probe failed, no reachable variant");
            return ScrapeResult {
                main_page_fail_reason: Some(fail.reason),
                ..Default::default()
            };
        }
    };

    let Ok(canonical) = Url::parse(&probed.canonical_url) else {
        return ScrapeResult {
            main_page_fail_reason: Some(FailReason::ScrapeError),
            ..Default::default()
        };
    };
    let host = registrable_host(canonical.host_str().unwrap_or_default());

    let profile = SiteAnalyzer::analyze(
        &probed.headers,
        probed.profile.cached_html.as_deref().unwrap_or(""),
        probed.profile.latency_ms,
        &probed.canonical_url,
    );
    let strategies = select_strategies(&profile);
    let mut used_strategy = strategies.first().copied().unwrap_or(Strategy::Standard);

    // The prober already fetched an exploitable body for the winning
    // variant; reuse it for the main page with zero extra network I/O
    // rather than re-running strategies.
    let mut main_html = probed.profile.cached_html.clone().filter(|h| !h.is_empty());
    let mut main_fail_reason: Option<FailReason> = None;

    if main_html.is_none() {
        let max_retries = ctx.config.fetcher.max_retries;
        'strategies: for strategy in &strategies {
            for attempt in 0..=max_retries {
                if attempt > 0 {
                    ctx.metrics.retry_recorded();
                }
                match ctx.fetch_via_pipeline(&host, canonical.as_str(), *strategy, deadline).await {
                    Ok((bytes, _status, _final_url, _elapsed_ms)) => {
                        main_html = Some(String::from_utf8_lossy(&bytes).into_owned());
                        main_fail_reason = None;
                        used_strategy = *strategy;
                        break 'strategies;
                    }
                    Err(reason) => {
                        main_fail_reason = Some(reason);
                        if matches!(reason, FailReason::InfraDeadline) {
                            break 'strategies;
                        }
                    }
                }
            }
        }
    }

    let Some(html) = main_html else {
        return ScrapeResult {
            main_page_fail_reason: Some(main_fail_reason.unwrap_or(FailReason::ProbeUnknown)),
            ..Default::default()
        };
    };

    let mut subpage_stats = SubpageStats::default();
    let mut main_text = extract_text(&html);
    let mut main_url = canonical.to_string();
    let mut main_bytes = html.len();

    let extracted = extract_links(&html, &canonical);
    let links_raw = extracted.raw;
    let found = extracted.links;
    let links_seen = found.len() as u32;

    // RESCUE: a reachable but near-empty main page is promoted to
    // whatever top-priority subpage returns substantive text.
    let rescue_min_chars = ctx.config.orchestrator.rescue_min_chars;
    if main_text.chars().count() < rescue_min_chars && !found.is_empty() {
        let rescue_candidates = prioritise(found.clone(), 3);
        for url in &rescue_candidates {
            if Instant::now() >= deadline {
                break;
            }
            subpage_stats.attempted += 1;
            ctx.metrics.subpage_attempted();
            match ctx.fetch_via_pipeline(&host, url.as_str(), used_strategy, deadline).await {
                Ok((bytes, _status, final_url, _elapsed_ms)) => {
                    let text = extract_text(&String::from_utf8_lossy(&bytes));
                    subpage_stats.ok += 1;
                    ctx.metrics.subpage_finished(true, None);
                    if text.chars().count() >= rescue_min_chars {
                        info!(registration_id = %work.registration_id, host = %host, rescue_url = %url, "thin main page rescued by subpage content");
                        main_text = text;
                        main_url = final_url;
                        main_bytes = bytes.len();
                        break;
                    }
                }
                Err(reason) => {
                    subpage_stats.failed += 1;
                    *subpage_stats.reason_histogram.entry(reason.as_key().to_string()).or_insert(0) += 1;
                    ctx.metrics.subpage_finished(false, Some(reason));
                }
            }
        }
    }

    let mut pages = vec![PageText {
        url: main_url,
        text: main_text,
        bytes: main_bytes,
    }];

    let selected = prioritise(found, ctx.config.orchestrator.max_subpages);
    let links_selected = selected.len() as u32;
    batch_fetch_subpages(ctx, &host, &selected, used_strategy, deadline, &mut pages, &mut subpage_stats).await;

    ctx.metrics.links_observed(links_raw, links_seen, links_selected);

    ScrapeResult {
        pages,
        main_page_fail_reason: None,
        subpage_stats,
        links_seen,
        links_selected,
    }
}

/// Fetches `links` in fixed-size batches, pinning one proxy per batch,
/// with intra-batch and inter-batch delays from configuration.
async fn batch_fetch_subpages(
    ctx: &ScrapeContext,
    host: &str,
    links: &[Url],
    strategy: Strategy,
    deadline: Instant,
    pages: &mut Vec<PageText>,
    stats: &mut SubpageStats,
) {
    let batch_size = ctx.config.orchestrator.batch_size.max(1);
    let intra_delay = Duration::from_millis(ctx.config.orchestrator.intra_batch_delay_ms);
    let inter_delay = Duration::from_millis(ctx.config.orchestrator.inter_batch_delay_ms);

    for (batch_idx, chunk) in links.chunks(batch_size).enumerate() {
        if Instant::now() >= deadline {
            break;
        }
        if batch_idx > 0 && !inter_delay.is_zero() {
            tokio::time::sleep(inter_delay).await;
        }

        let mut batch_proxy = ctx.borrow_proxy();

        for (i, url) in chunk.iter().enumerate() {
            if Instant::now() >= deadline {
                break;
            }
            if i > 0 && !intra_delay.is_zero() {
                tokio::time::sleep(intra_delay).await;
            }

            stats.attempted += 1;
            ctx.metrics.subpage_attempted();

            let outcome = ctx
                .fetch_with_proxy(host, url.as_str(), strategy, deadline, batch_proxy.clone())
                .await;

            match outcome {
                Ok((bytes, _status, final_url, _elapsed_ms, proxy)) => {
                    batch_proxy = Some(proxy);
                    let html = String::from_utf8_lossy(&bytes).into_owned();
                    let text = extract_text(&html);
                    let bytes_len = html.len();
                    pages.push(PageText {
                        url: final_url,
                        text,
                        bytes: bytes_len,
                    });
                    stats.ok += 1;
                    ctx.metrics.subpage_finished(true, None);
                }
                Err(reason) => {
                    stats.failed += 1;
                    *stats.reason_histogram.entry(reason.as_key().to_string()).or_insert(0) += 1;
                    ctx.metrics.subpage_finished(false, Some(reason));
                }
            }
        }
    }
}
