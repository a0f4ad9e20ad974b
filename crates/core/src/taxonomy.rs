use std::fmt;

/// The closed failure taxonomy. Every failure is classified into one of
/// these at its point of origin; higher layers aggregate but never
/// reclassify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FailReason {
    ProbeTimeout,
    ProbeSsl,
    ProbeServerError,
    ProbeBlocked,
    ProbeUnknown,

    ProxyTimeout,
    ProxyConnection,
    ProxyEmptyResponse,
    ProxyHttp5xx,
    ProxyHttp403,
    ProxyHttp429,
    ProxyOther,

    ScrapeError,

    InfraConcurrencyTimeout,
    InfraRatelimitTimeout,
    InfraCircuitOpen,
    InfraCancelled,
    InfraDeadline,
}

impl FailReason {
    /// The wire/status-object key, e.g. `probe:timeout`.
    pub fn as_key(&self) -> &'static str {
        match self {
            FailReason::ProbeTimeout => "probe:timeout",
            FailReason::ProbeSsl => "probe:ssl",
            FailReason::ProbeServerError => "probe:server_error",
            FailReason::ProbeBlocked => "probe:blocked",
            FailReason::ProbeUnknown => "probe:unknown",
            FailReason::ProxyTimeout => "proxy:timeout",
            FailReason::ProxyConnection => "proxy:connection",
            FailReason::ProxyEmptyResponse => "proxy:empty_response",
            FailReason::ProxyHttp5xx => "proxy:http_5xx",
            FailReason::ProxyHttp403 => "proxy:http_403",
            FailReason::ProxyHttp429 => "proxy:http_429",
            FailReason::ProxyOther => "proxy:other",
            FailReason::ScrapeError => "scrape:error",
            FailReason::InfraConcurrencyTimeout => "infra:concurrency_timeout",
            FailReason::InfraRatelimitTimeout => "infra:ratelimit_timeout",
            FailReason::InfraCircuitOpen => "infra:circuit_open",
            FailReason::InfraCancelled => "infra:cancelled",
            FailReason::InfraDeadline => "infra:deadline",
        }
    }

    /// Whether this reason originated in the Fetcher and therefore drives
    /// breaker/pool outcome reporting. Probe failures and circuit-open
    /// rejections never left the local process and must not count against
    /// a proxy or a breaker.
    pub fn counts_against_proxy(&self) -> bool {
        matches!(
            self,
            FailReason::ProxyTimeout
                | FailReason::ProxyConnection
                | FailReason::ProxyEmptyResponse
                | FailReason::ProxyHttp5xx
                | FailReason::ProxyHttp403
                | FailReason::ProxyHttp429
                | FailReason::ProxyOther
        )
    }

    /// `infra:cancelled` is reported as a failure to the orchestrator but
    /// must not degrade proxy weighting or breaker counting.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FailReason::InfraCancelled)
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// Severity preference order used by the Prober to pick one reason out of
/// four failed variant fetches: higher value wins.
pub fn probe_failure_severity(reason: FailReason) -> u8 {
    match reason {
        FailReason::ProbeBlocked => 4,
        FailReason::ProbeServerError => 3,
        FailReason::ProbeSsl => 2,
        FailReason::ProbeTimeout => 1,
        _ => 0,
    }
}

/// Maps a fetcher-level outcome reason onto the probe-level taxonomy, used
/// when the Prober's underlying fetch fails: TLS handshake errors become
/// `probe:ssl`, and so on, when called from the Prober.
pub fn as_probe_reason(reason: FailReason) -> FailReason {
    match reason {
        FailReason::ProxyConnection => FailReason::ProbeUnknown,
        FailReason::ProxyTimeout => FailReason::ProbeTimeout,
        FailReason::ProxyHttp5xx => FailReason::ProbeServerError,
        FailReason::ProxyHttp403 | FailReason::ProxyHttp429 => FailReason::ProbeBlocked,
        other if matches!(
            other,
            FailReason::ProbeTimeout
                | FailReason::ProbeSsl
                | FailReason::ProbeServerError
                | FailReason::ProbeBlocked
                | FailReason::ProbeUnknown
        ) =>
        {
            other
        }
        _ => FailReason::ProbeUnknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order_prefers_blocked_over_timeout() {
        assert!(
            probe_failure_severity(FailReason::ProbeBlocked)
                > probe_failure_severity(FailReason::ProbeTimeout)
        );
    }

    #[test]
    fn cancellation_never_counts_against_proxy() {
        assert!(!FailReason::InfraCancelled.counts_against_proxy());
        assert!(FailReason::InfraCancelled.is_cancellation());
    }

    #[test]
    fn proxy_reasons_count_probe_reasons_do_not() {
        assert!(FailReason::ProxyTimeout.counts_against_proxy());
        assert!(!FailReason::ProbeTimeout.counts_against_proxy());
        assert!(!FailReason::InfraCircuitOpen.counts_against_proxy());
    }
}
