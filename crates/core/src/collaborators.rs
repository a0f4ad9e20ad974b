//! Thin contracts for the systems that sit outside the scraping fabric.
//! The fabric only ever calls these traits; it never implements search
//! ranking, LLM decoding, chunking or persistence itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

use crate::domain::ScrapeResult;

/// Search-engine client contract: at-most-25 results, best-effort
/// ranking, budgeted by the caller's own timeout.
#[async_trait]
pub trait CandidateUrlSource: Send + Sync {
    async fn find_candidates(
        &self,
        trade_name: Option<&str>,
        city: Option<&str>,
        registration_id: &str,
    ) -> Vec<Url>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileFragment {
    pub fields: HashMap<String, String>,
}

/// LLM provider contract: the fabric hands over the aggregated `pages`
/// text only; chunking/merging/schema enforcement is the caller's
/// responsibility.
#[async_trait]
pub trait ProfileExtractor: Send + Sync {
    async fn extract(&self, chunk: &str, schema_hint: &str) -> Option<ProfileFragment>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyStats {
    pub pages: usize,
    pub subpages_ok: u32,
    pub subpages_failed: u32,
}

/// Relational persistence sink contract.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save_pages(
        &self,
        batch_id: &str,
        company_id: &str,
        result: &ScrapeResult,
        stats: &CompanyStats,
    );

    async fn save_status(&self, batch_id: &str, snapshot: serde_json::Value);
}

/// In-memory reference implementation of `CandidateUrlSource`, used by the
/// demo binary and integration tests. Returns whatever was registered for
/// the input registration id, capped at 25 per the contract.
#[derive(Default)]
pub struct StaticCandidateSource {
    by_registration_id: HashMap<String, Vec<Url>>,
}

impl StaticCandidateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration_id: impl Into<String>, urls: Vec<Url>) {
        self.by_registration_id.insert(registration_id.into(), urls);
    }
}

#[async_trait]
impl CandidateUrlSource for StaticCandidateSource {
    async fn find_candidates(
        &self,
        _trade_name: Option<&str>,
        _city: Option<&str>,
        registration_id: &str,
    ) -> Vec<Url> {
        self.by_registration_id
            .get(registration_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .take(25)
            .collect()
    }
}

/// In-memory reference implementation of `ProfileExtractor`, used by the
/// demo binary and integration tests in place of a real LLM call. Looks
/// for each comma-separated field name in `schema_hint` as a substring of
/// the chunk and captures a short window of text starting at the match.
pub struct KeywordProfileExtractor;

#[async_trait]
impl ProfileExtractor for KeywordProfileExtractor {
    async fn extract(&self, chunk: &str, schema_hint: &str) -> Option<ProfileFragment> {
        let lower = chunk.to_lowercase();
        let mut fields = HashMap::new();
        for field in schema_hint.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(idx) = lower.find(&field.to_lowercase()) {
                let window: String = chunk[idx..].chars().take(120).collect();
                fields.insert(field.to_string(), window);
            }
        }
        if fields.is_empty() {
            None
        } else {
            Some(ProfileFragment { fields })
        }
    }
}

/// In-memory `ResultSink` that keeps everything it's handed — useful for
/// tests that want to assert on what the orchestrator published.
#[derive(Default)]
pub struct InMemorySink {
    pub saved: Mutex<Vec<(String, String, CompanyStats)>>,
    pub statuses: Mutex<Vec<(String, serde_json::Value)>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultSink for InMemorySink {
    async fn save_pages(
        &self,
        batch_id: &str,
        company_id: &str,
        _result: &ScrapeResult,
        stats: &CompanyStats,
    ) {
        self.saved.lock().unwrap().push((
            batch_id.to_string(),
            company_id.to_string(),
            stats.clone(),
        ));
    }

    async fn save_status(&self, batch_id: &str, snapshot: serde_json::Value) {
        self.statuses
            .lock()
            .unwrap()
            .push((batch_id.to_string(), snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_candidate_source_returns_registered_urls_capped_at_25() {
        let mut source = StaticCandidateSource::new();
        let urls: Vec<Url> = (0..30)
            .map(|i| Url::parse(&format!("https://example{i}.com")).unwrap())
            .collect();
        source.register("123", urls);
        let found = source.find_candidates(None, None, "123").await;
        assert_eq!(found.len(), 25);
        let missing = source.find_candidates(None, None, "999").await;
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn keyword_profile_extractor_captures_a_window_per_matched_field() {
        let extractor = KeywordProfileExtractor;
        let chunk = "Acme Ltda. CNPJ: 12.345.678/0001-90. Telefone: (11) 4000-0000.";
        let fragment = extractor.extract(chunk, "cnpj, telefone").await.unwrap();
        assert!(fragment.fields.contains_key("cnpj"));
        assert!(fragment.fields.contains_key("telefone"));
    }

    #[tokio::test]
    async fn keyword_profile_extractor_returns_none_on_no_match() {
        let extractor = KeywordProfileExtractor;
        let fragment = extractor.extract("nothing relevant here", "cnpj").await;
        assert!(fragment.is_none());
    }
}
