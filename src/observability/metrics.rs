//! Metrics for the normalization pipeline
//!
//! Thin wrappers over the `metrics` facade using Prometheus naming conventions.
//! Recording is a no-op until a recorder is installed with [`init`].

use std::fmt;
use std::net::SocketAddr;

use tracing::{info, warn};

/// Enum representing all metric names used in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Benchmark matcher
    BenchmarkLookups,
    BenchmarkHits,
    BenchmarkMisses,

    // Multi-provider classifier
    ClassifierRequests,
    ClassifierProviderCalls,
    ClassifierProviderFailures,
    ClassifierProviderDuration,
    ClassifierUnavailable,
    ClassifierConfidence,
    ClassifierBreakerOpened,

    // Taxonomy
    TaxonomyResolutions,
    TaxonomyLevelReached,
    TaxonomyCacheEvictions,

    // Orchestrator
    ProcessesStarted,
    ProcessesFinished,
    RecordsProcessed,
    RecordsFailed,
    BatchSize,
    RecordDuration,

    // Duplicates
    DuplicateGroupsDetected,
    DuplicateMerges,
    DuplicateItemsFolded,

    // Quality
    QualityIssuesCreated,
    QualitySuggestionsApplied,
    QualityOverallScore,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::BenchmarkLookups => "nsi_benchmark_lookups_total",
            MetricName::BenchmarkHits => "nsi_benchmark_hits_total",
            MetricName::BenchmarkMisses => "nsi_benchmark_misses_total",

            MetricName::ClassifierRequests => "nsi_classifier_requests_total",
            MetricName::ClassifierProviderCalls => "nsi_classifier_provider_calls_total",
            MetricName::ClassifierProviderFailures => "nsi_classifier_provider_failures_total",
            MetricName::ClassifierProviderDuration => "nsi_classifier_provider_duration_seconds",
            MetricName::ClassifierUnavailable => "nsi_classifier_unavailable_total",
            MetricName::ClassifierConfidence => "nsi_classifier_confidence",
            MetricName::ClassifierBreakerOpened => "nsi_classifier_breaker_opened_total",

            MetricName::TaxonomyResolutions => "nsi_taxonomy_resolutions_total",
            MetricName::TaxonomyLevelReached => "nsi_taxonomy_level_reached",
            MetricName::TaxonomyCacheEvictions => "nsi_taxonomy_cache_evictions_total",

            MetricName::ProcessesStarted => "nsi_processes_started_total",
            MetricName::ProcessesFinished => "nsi_processes_finished_total",
            MetricName::RecordsProcessed => "nsi_records_processed_total",
            MetricName::RecordsFailed => "nsi_records_failed_total",
            MetricName::BatchSize => "nsi_batch_size",
            MetricName::RecordDuration => "nsi_record_duration_seconds",

            MetricName::DuplicateGroupsDetected => "nsi_duplicate_groups_detected_total",
            MetricName::DuplicateMerges => "nsi_duplicate_merges_total",
            MetricName::DuplicateItemsFolded => "nsi_duplicate_items_folded_total",

            MetricName::QualityIssuesCreated => "nsi_quality_issues_created_total",
            MetricName::QualitySuggestionsApplied => "nsi_quality_suggestions_applied_total",
            MetricName::QualityOverallScore => "nsi_quality_overall_score",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Install the Prometheus exporter with an HTTP listener on the given port.
pub fn init(port: u16) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
        Err(e) => warn!("Prometheus exporter install failed (possibly already installed): {}", e),
    }
}

pub mod benchmark {
    use super::MetricName;

    pub fn lookup(hit: bool) {
        ::metrics::counter!(MetricName::BenchmarkLookups.as_str()).increment(1);
        let outcome = if hit {
            MetricName::BenchmarkHits
        } else {
            MetricName::BenchmarkMisses
        };
        ::metrics::counter!(outcome.as_str()).increment(1);
    }
}

pub mod classifier {
    use super::MetricName;

    pub fn request(strategy: &'static str) {
        ::metrics::counter!(MetricName::ClassifierRequests.as_str(), "strategy" => strategy)
            .increment(1);
    }

    pub fn provider_call(provider: &str, secs: f64, ok: bool) {
        ::metrics::counter!(
            MetricName::ClassifierProviderCalls.as_str(),
            "provider" => provider.to_string()
        )
        .increment(1);
        ::metrics::histogram!(
            MetricName::ClassifierProviderDuration.as_str(),
            "provider" => provider.to_string()
        )
        .record(secs);
        if !ok {
            ::metrics::counter!(
                MetricName::ClassifierProviderFailures.as_str(),
                "provider" => provider.to_string()
            )
            .increment(1);
        }
    }

    pub fn unavailable() {
        ::metrics::counter!(MetricName::ClassifierUnavailable.as_str()).increment(1);
    }

    pub fn confidence(value: f64) {
        ::metrics::histogram!(MetricName::ClassifierConfidence.as_str()).record(value);
    }

    pub fn breaker_opened(provider: &str) {
        ::metrics::counter!(
            MetricName::ClassifierBreakerOpened.as_str(),
            "provider" => provider.to_string()
        )
        .increment(1);
    }
}

pub mod taxonomy {
    use super::MetricName;

    pub fn resolved(level_reached: usize, complete: bool) {
        ::metrics::counter!(
            MetricName::TaxonomyResolutions.as_str(),
            "complete" => complete.to_string()
        )
        .increment(1);
        ::metrics::histogram!(MetricName::TaxonomyLevelReached.as_str()).record(level_reached as f64);
    }

    pub fn cache_evicted(count: usize) {
        ::metrics::counter!(MetricName::TaxonomyCacheEvictions.as_str()).increment(count as u64);
    }
}

pub mod orchestrator {
    use super::MetricName;

    pub fn process_started() {
        ::metrics::counter!(MetricName::ProcessesStarted.as_str()).increment(1);
    }

    pub fn process_finished(status: &'static str) {
        ::metrics::counter!(MetricName::ProcessesFinished.as_str(), "status" => status).increment(1);
    }

    pub fn record_processed(level: &'static str, secs: f64) {
        ::metrics::counter!(MetricName::RecordsProcessed.as_str(), "level" => level).increment(1);
        ::metrics::histogram!(MetricName::RecordDuration.as_str()).record(secs);
    }

    pub fn record_failed(kind: &'static str) {
        ::metrics::counter!(MetricName::RecordsFailed.as_str(), "kind" => kind).increment(1);
    }

    pub fn batch_pulled(size: usize) {
        ::metrics::histogram!(MetricName::BatchSize.as_str()).record(size as f64);
    }
}

pub mod duplicates {
    use super::MetricName;

    pub fn groups_detected(count: usize) {
        ::metrics::counter!(MetricName::DuplicateGroupsDetected.as_str()).increment(count as u64);
    }

    pub fn merged(folded: usize) {
        ::metrics::counter!(MetricName::DuplicateMerges.as_str()).increment(1);
        ::metrics::counter!(MetricName::DuplicateItemsFolded.as_str()).increment(folded as u64);
    }
}

pub mod quality {
    use super::MetricName;

    pub fn issue_created(kind: &'static str, rule: &str) {
        ::metrics::counter!(
            MetricName::QualityIssuesCreated.as_str(),
            "kind" => kind,
            "rule" => rule.to_string()
        )
        .increment(1);
    }

    pub fn suggestion_applied() {
        ::metrics::counter!(MetricName::QualitySuggestionsApplied.as_str()).increment(1);
    }

    pub fn overall_score(percentage: f64) {
        ::metrics::gauge!(MetricName::QualityOverallScore.as_str()).set(percentage);
    }
}
