mod cli;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use empresa_core::collaborators::{
    CompanyStats, InMemorySink, KeywordProfileExtractor, ProfileExtractor, ResultSink, StaticCandidateSource,
};
use empresa_core::config::AppConfig;
use empresa_core::CompanyWork;
use empresa_orchestrator::{scrape_company, BatchRegistry, ScrapeContext};

use crate::cli::{Cli, Commands};

// glibc malloc doesn't release memory well under the fan-out of thousands
// of per-company tasks this binary drives.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Deserialize)]
struct BatchEntry {
    registration_id: String,
    url: Option<String>,
    trade_name: Option<String>,
    city: Option<String>,
    /// Pre-resolved candidates a caller already has (e.g. from its own
    /// search-engine lookup), consulted only when `url` is absent.
    #[serde(default)]
    candidate_urls: Vec<String>,
}

impl From<&BatchEntry> for CompanyWork {
    fn from(e: &BatchEntry) -> Self {
        CompanyWork {
            registration_id: e.registration_id.clone(),
            candidate_url: e.url.clone(),
            trade_name: e.trade_name.clone(),
            city: e.city.clone(),
        }
    }
}

fn main() -> Result<()> {
    // Custom runtime sized for high fan-out: thousands of per-company tasks
    // multiplexed onto a bounded thread pool.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(32)
        .thread_stack_size(8 * 1024 * 1024)
        .max_blocking_threads(512)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::ShowConfig) {
        println!("{}", include_str!("../config/default.toml"));
        return Ok(());
    }

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using built-in defaults");
        include_str!("../config/default.toml").to_string()
    });
    let config: AppConfig = AppConfig::from_toml_str(&config_str).context("parsing config")?;

    match cli.command {
        Commands::ShowConfig => unreachable!("handled above"),
        Commands::Submit { input, proxies, workers } => run_submit(config, input, proxies, workers).await,
        Commands::Demo { url, proxies } => run_demo(config, url, proxies).await,
    }
}

/// Field names the in-memory extractor looks for in aggregated page text,
/// standing in for whatever schema a real LLM-backed extractor would take.
const DEMO_SCHEMA_HINT: &str = "cnpj, telefone, email";

async fn run_submit(config: AppConfig, input: String, proxies: Vec<String>, workers: usize) -> Result<()> {
    let raw = std::fs::read_to_string(&input).with_context(|| format!("reading batch input {input}"))?;
    let entries: Vec<BatchEntry> = serde_json::from_str(&raw).context("parsing batch input JSON")?;

    let mut candidate_source = StaticCandidateSource::new();
    for entry in &entries {
        if entry.url.is_none() && !entry.candidate_urls.is_empty() {
            let urls = entry
                .candidate_urls
                .iter()
                .filter_map(|u| url::Url::parse(u).ok())
                .collect();
            candidate_source.register(entry.registration_id.clone(), urls);
        }
    }
    let work: Vec<CompanyWork> = entries.iter().map(CompanyWork::from).collect();

    info!(count = work.len(), proxies = proxies.len(), "submitting batch");

    let ctx = Arc::new(ScrapeContext::with_candidate_source(
        config,
        proxies,
        work.len() as u64,
        Arc::new(candidate_source),
    ));
    ctx.health_check_proxies("https://example.com".to_string()).await;

    let batch_id = format!("batch-{}", Instant::now().elapsed().as_nanos());
    let registry = BatchRegistry::new(ctx.clone(), batch_id.as_str(), workers.max(1));

    let sink = InMemorySink::new();
    let extractor = KeywordProfileExtractor;
    let results = registry.run(work).await;
    for (item, result) in &results {
        let stats = CompanyStats {
            pages: result.pages.len(),
            subpages_ok: result.subpage_stats.ok,
            subpages_failed: result.subpage_stats.failed,
        };
        let aggregated: String = result.pages.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join("\n");
        if let Some(fragment) = extractor.extract(&aggregated, DEMO_SCHEMA_HINT).await {
            info!(registration_id = %item.registration_id, fields = fragment.fields.len(), "profile fragment extracted");
        }
        sink.save_pages(&batch_id, &item.registration_id, result, &stats).await;
    }

    let status = registry.status();
    sink.save_status(&batch_id, serde_json::to_value(&status)?).await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_demo(config: AppConfig, url: String, proxies: Vec<String>) -> Result<()> {
    let proxies = if proxies.is_empty() {
        vec!["http://127.0.0.1:8080".to_string()]
    } else {
        proxies
    };
    let ctx = ScrapeContext::new(config, proxies, 1);
    ctx.health_check_proxies("https://example.com".to_string()).await;

    let work = CompanyWork {
        registration_id: "demo".to_string(),
        candidate_url: Some(url),
        trade_name: None,
        city: None,
    };

    let result = scrape_company(&ctx, &work).await;
    println!(
        "pages={} main_page_fail_reason={:?} links_seen={} links_selected={} subpages(attempted={}, ok={}, failed={})",
        result.pages.len(),
        result.main_page_fail_reason,
        result.links_seen,
        result.links_selected,
        result.subpage_stats.attempted,
        result.subpage_stats.ok,
        result.subpage_stats.failed,
    );
    for page in &result.pages {
        let preview: String = page.text.chars().take(160).collect();
        println!("- {} ({} bytes): {preview}", page.url, page.bytes);
    }
    Ok(())
}
