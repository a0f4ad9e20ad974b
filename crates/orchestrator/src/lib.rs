//! Wires every fabric component behind one explicit [`ScrapeContext`] and
//! drives the per-company state machine plus the batch worker pool.

mod batch;
mod company;
mod context;

pub use batch::{BatchRegistry, BatchStatus};
pub use company::scrape_company;
pub use context::ScrapeContext;

#[cfg(test)]
mod tests {
    use super::*;
    use empresa_core::config::AppConfig;
    use empresa_core::CompanyWork;

    fn test_config() -> AppConfig {
        AppConfig::from_toml_str(
            r#"
            [gate]
            global_concurrency = 10
            per_domain_limit = 2
            slow_domain_limit = 1
            slow_p95_threshold_ms = 8000

            [rate_limiter]
            rpm_default = 6000
            rpm_slow = 600
            burst_size = 100

            [breaker]
            breaker_threshold = 12
            breaker_recovery_ms = 30000
            breaker_half_open_max = 3

            [fetcher]
            probe_timeout_ms = 200
            fetch_timeout_ms_fast = 200
            fetch_timeout_ms_slow = 200
            max_retries = 0

            [orchestrator]
            batch_size = 4
            intra_batch_delay_ms = 0
            inter_batch_delay_ms = 0
            rescue_min_chars = 500
            max_subpages = 5
            company_deadline_ms = 1000

            [proxy_pool]
            proxy_min_success_rate = 0.10
            proxy_min_observations = 8
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unresolved_candidate_url_yields_scrape_error_without_network_io() {
        let ctx = ScrapeContext::new(test_config(), vec!["http://127.0.0.1:1".to_string()], 1);
        let work = CompanyWork {
            registration_id: "1".into(),
            candidate_url: None,
            trade_name: None,
            city: None,
        };
        let result = scrape_company(&ctx, &work).await;
        assert!(result.pages.is_empty());
        assert!(result.main_page_fail_reason.is_some());
        assert!(result.is_consistent());
    }

    #[tokio::test]
    async fn candidate_source_resolves_a_missing_url_before_probing() {
        use empresa_core::collaborators::StaticCandidateSource;
        use std::sync::Arc;

        let mut source = StaticCandidateSource::new();
        source.register("42", vec![url::Url::parse("http://127.0.0.1:1/").unwrap()]);
        let ctx = ScrapeContext::with_candidate_source(
            test_config(),
            vec!["http://127.0.0.1:1".to_string()],
            1,
            Arc::new(source),
        );
        let work = CompanyWork {
            registration_id: "42".into(),
            candidate_url: None,
            trade_name: Some("Acme".into()),
            city: Some("Sao Paulo".into()),
        };
        let result = scrape_company(&ctx, &work).await;
        // The candidate resolves to an address nothing listens on, so the
        // probe itself fails — but it proves resolution ran, since an
        // unresolved company fails before any prober call.
        assert!(result.main_page_fail_reason.is_some());
        assert_ne!(result.main_page_fail_reason, Some(empresa_core::FailReason::ScrapeError));
    }

    #[tokio::test]
    async fn empty_proxy_pool_fails_fast_with_proxy_connection_reason() {
        let ctx = ScrapeContext::new(test_config(), vec![], 1);
        let work = CompanyWork {
            registration_id: "2".into(),
            candidate_url: Some("example.com".into()),
            trade_name: None,
            city: None,
        };
        let result = scrape_company(&ctx, &work).await;
        assert!(result.pages.is_empty());
        assert!(result.main_page_fail_reason.is_some());
        assert!(result.is_consistent());
    }

    #[tokio::test]
    async fn all_discarded_proxies_also_fail_fast() {
        let ctx = ScrapeContext::new(test_config(), vec!["http://127.0.0.1:1".to_string()], 1);
        for p in ctx.proxy_pool.proxies() {
            p.mark_discarded();
        }
        let work = CompanyWork {
            registration_id: "3".into(),
            candidate_url: Some("example.com".into()),
            trade_name: None,
            city: None,
        };
        let result = scrape_company(&ctx, &work).await;
        assert!(result.pages.is_empty());
        assert_eq!(result.main_page_fail_reason, Some(empresa_core::FailReason::ProxyConnection));
    }

    #[tokio::test]
    async fn batch_registry_processes_every_item_with_unreachable_proxies() {
        let ctx = std::sync::Arc::new(ScrapeContext::new(test_config(), vec![], 2));
        let registry = BatchRegistry::new(ctx, "batch-1", 2);
        let work: Vec<CompanyWork> = (0..5)
            .map(|i| CompanyWork {
                registration_id: i.to_string(),
                candidate_url: Some("example.com".into()),
                trade_name: None,
                city: None,
            })
            .collect();
        let results = registry.run(work).await;
        assert_eq!(results.len(), 5);
        let status = registry.status();
        assert_eq!(status.status, "done");
        assert_eq!(status.snapshot.processed, 5);
        assert_eq!(status.infrastructure.proxy_pool.total, 0);
    }
}
