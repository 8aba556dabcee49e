//! Multi-provider classification.
//!
//! Providers are black boxes behind [`ClassificationProvider`]. Each call is
//! time-boxed and reported to the per-provider circuit breaker; the configured
//! [`AggregationStrategy`] decides how many providers are asked and how their
//! answers are combined.

mod health;
mod strategy;

pub use health::{BreakerState, ProviderHealth, ProviderHealthSnapshot};
pub use strategy::AggregationStrategy;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::app::ports::{ClassificationProvider, ProviderAnswer};
use crate::config::ClassifierConfig;
use crate::domain::EntityType;
use crate::error::{PipelineError, Result};
use crate::observability::metrics;
use crate::pipeline::cancel::CancelSignal;

/// What one provider did during one classification call
#[derive(Debug, Clone, Serialize)]
pub struct ProviderOutcome {
    pub provider: String,
    pub answer: Option<ProviderAnswer>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ProviderOutcome {
    fn failed(provider: &str, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            provider: provider.to_string(),
            answer: None,
            error: Some(error.into()),
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Aggregated classification result
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub normalized_name: String,
    pub category: Option<String>,
    pub confidence: f64,
    pub provider_used: String,
    pub strategy: AggregationStrategy,
    pub successes: usize,
    pub failures: usize,
    pub outcomes: Vec<ProviderOutcome>,
    #[serde(skip)]
    pub duration: Duration,
}

/// Timeouts, health tracking and cancellation shared by every provider call
pub(crate) struct CallContext {
    pub health: Arc<ProviderHealth>,
    pub provider_timeout: Duration,
    pub overall_timeout: Duration,
    pub cancel: CancelSignal,
}

/// One time-boxed, cancellable provider call. Never fails; failures are outcomes.
pub(crate) async fn call_provider(
    provider: Arc<dyn ClassificationProvider>,
    health: Arc<ProviderHealth>,
    name: String,
    entity_type: EntityType,
    timeout: Duration,
    cancel: CancelSignal,
) -> ProviderOutcome {
    let id = provider.id().to_string();
    let started = Instant::now();
    let call = cancel.guard("provider call", async {
        match tokio::time::timeout(timeout, provider.normalize(&name, entity_type)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(format!(
                "provider '{}' exceeded {:?}",
                id, timeout
            ))),
        }
    });
    let result = call.await;
    let elapsed = started.elapsed();

    match result {
        Ok(answer) => {
            health.record_success(&id);
            metrics::classifier::provider_call(&id, elapsed.as_secs_f64(), true);
            debug!(provider = %id, confidence = answer.confidence, "Provider answered");
            ProviderOutcome {
                provider: id,
                answer: Some(ProviderAnswer {
                    confidence: answer.confidence.clamp(0.0, 1.0),
                    ..answer
                }),
                error: None,
                duration_ms: elapsed.as_millis() as u64,
            }
        }
        Err(err) => {
            // A stop request is not the provider's fault.
            if !cancel.is_cancelled() {
                health.record_failure(&id);
            }
            metrics::classifier::provider_call(&id, elapsed.as_secs_f64(), false);
            warn!(provider = %id, error = %err, "Provider call failed");
            ProviderOutcome::failed(&id, err.to_string(), elapsed)
        }
    }
}

/// Queries the configured providers through the configured aggregation strategy
pub struct MultiProviderClassifier {
    providers: Vec<Arc<dyn ClassificationProvider>>,
    strategy: AggregationStrategy,
    health: Arc<ProviderHealth>,
    provider_timeout: Duration,
    overall_timeout: Duration,
}

impl MultiProviderClassifier {
    pub fn new(mut providers: Vec<Arc<dyn ClassificationProvider>>, config: &ClassifierConfig) -> Self {
        providers.sort_by_key(|p| p.priority());
        Self {
            providers,
            strategy: config.strategy,
            health: Arc::new(ProviderHealth::new(&config.breaker)),
            provider_timeout: config.provider_timeout(),
            overall_timeout: config.overall_timeout(),
        }
    }

    pub fn strategy(&self) -> AggregationStrategy {
        self.strategy
    }

    pub fn health(&self) -> &ProviderHealth {
        &self.health
    }

    /// Providers in dispatch order: priority order with open breakers moved last.
    /// Parallel strategies skip open breakers unless nothing healthy remains.
    fn dispatch_order(&self) -> Vec<Arc<dyn ClassificationProvider>> {
        let (healthy, open): (Vec<_>, Vec<_>) = self
            .providers
            .iter()
            .cloned()
            .partition(|p| !self.health.is_deprioritized(p.id()));
        match self.strategy {
            AggregationStrategy::FirstSuccess => healthy.into_iter().chain(open).collect(),
            AggregationStrategy::MajorityVote | AggregationStrategy::BestConfidence => {
                if healthy.is_empty() {
                    open
                } else {
                    healthy
                }
            }
        }
    }

    #[instrument(skip(self, cancel), fields(strategy = self.strategy.as_str()))]
    pub async fn classify(
        &self,
        name: &str,
        entity_type: EntityType,
        cancel: &CancelSignal,
    ) -> Result<Classification> {
        if name.trim().is_empty() {
            return Err(PipelineError::ValidationFailed("name is empty".into()));
        }
        metrics::classifier::request(self.strategy.as_str());
        let providers = self.dispatch_order();
        if providers.is_empty() {
            metrics::classifier::unavailable();
            return Err(PipelineError::ProviderUnavailable(
                "no classification providers configured".into(),
            ));
        }

        let ctx = CallContext {
            health: self.health.clone(),
            provider_timeout: self.provider_timeout,
            overall_timeout: self.overall_timeout,
            cancel: cancel.clone(),
        };
        let result = self.strategy.classify(&providers, name, entity_type, &ctx).await;
        match &result {
            Ok(classification) => {
                metrics::classifier::confidence(classification.confidence);
                debug!(
                    provider = %classification.provider_used,
                    confidence = classification.confidence,
                    successes = classification.successes,
                    failures = classification.failures,
                    "Classified"
                );
            }
            Err(PipelineError::ProviderUnavailable(_)) => metrics::classifier::unavailable(),
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Script {
        Answer(&'static str, f64),
        Fail,
        Hang,
        Empty,
    }

    struct Scripted {
        id: &'static str,
        priority: i32,
        script: Script,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(id: &'static str, priority: i32, script: Script) -> Arc<Self> {
            Arc::new(Self {
                id,
                priority,
                script,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ClassificationProvider for Scripted {
        fn id(&self) -> &str {
            self.id
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn normalize(&self, _name: &str, _entity_type: EntityType) -> Result<ProviderAnswer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Answer(name, confidence) => Ok(ProviderAnswer {
                    normalized_name: name.to_string(),
                    category: Some("Крепеж".to_string()),
                    confidence,
                }),
                Script::Fail => Err(PipelineError::ProviderUnavailable("HTTP 503".into())),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(PipelineError::internal("unreachable"))
                }
                Script::Empty => Ok(ProviderAnswer {
                    normalized_name: String::new(),
                    category: None,
                    confidence: 0.0,
                }),
            }
        }
    }

    fn config(strategy: AggregationStrategy) -> ClassifierConfig {
        ClassifierConfig {
            strategy,
            provider_timeout_ms: 50,
            overall_timeout_ms: 200,
            ..ClassifierConfig::default()
        }
    }

    fn classifier(
        strategy: AggregationStrategy,
        providers: Vec<Arc<dyn ClassificationProvider>>,
    ) -> MultiProviderClassifier {
        MultiProviderClassifier::new(providers, &config(strategy))
    }

    #[tokio::test]
    async fn first_success_stops_at_first_usable_answer() {
        let failing = Scripted::new("failing", 1, Script::Fail);
        let good = Scripted::new("good", 2, Script::Answer("Болт М6", 0.8));
        let unused = Scripted::new("unused", 3, Script::Answer("Болт", 0.9));
        let c = classifier(
            AggregationStrategy::FirstSuccess,
            vec![unused.clone(), good.clone(), failing.clone()],
        );

        let result = c.classify("болт м6", EntityType::Nomenclature, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.provider_used, "good");
        assert_eq!(result.normalized_name, "Болт М6");
        assert_eq!(result.failures, 1);
        assert_eq!(unused.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn majority_vote_reports_agreement_ratio() {
        let c = classifier(
            AggregationStrategy::MajorityVote,
            vec![
                Scripted::new("a", 1, Script::Answer("Болт М6", 0.7)),
                Scripted::new("b", 2, Script::Answer("болт м6", 0.9)),
                Scripted::new("c", 3, Script::Answer("Винт М6", 0.95)),
                Scripted::new("d", 4, Script::Fail),
            ],
        );
        let result = c.classify("болт м6", EntityType::Nomenclature, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.provider_used, "b");
        assert!((result.confidence - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.successes, 3);
        assert_eq!(result.failures, 1);
    }

    #[tokio::test]
    async fn best_confidence_survives_a_hanging_provider() {
        let c = classifier(
            AggregationStrategy::BestConfidence,
            vec![
                Scripted::new("slow", 1, Script::Hang),
                Scripted::new("low", 2, Script::Answer("Гайка", 0.4)),
                Scripted::new("high", 3, Script::Answer("Гайка М8", 0.92)),
            ],
        );
        let result = c.classify("гайка м8", EntityType::Nomenclature, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.provider_used, "high");
        assert_eq!(result.confidence, 0.92);
        let slow = result.outcomes.iter().find(|o| o.provider == "slow").unwrap();
        assert!(slow.error.is_some());
    }

    #[tokio::test]
    async fn all_failing_is_provider_unavailable_not_no_match() {
        let c = classifier(
            AggregationStrategy::MajorityVote,
            vec![
                Scripted::new("a", 1, Script::Hang),
                Scripted::new("b", 2, Script::Fail),
            ],
        );
        let err = c.classify("x-100", EntityType::Nomenclature, &CancelSignal::never()).await.unwrap_err();
        assert_eq!(err.kind(), "provider_unavailable");

        let c = classifier(
            AggregationStrategy::FirstSuccess,
            vec![Scripted::new("a", 1, Script::Empty), Scripted::new("b", 2, Script::Fail)],
        );
        let err = c.classify("x-100", EntityType::Nomenclature, &CancelSignal::never()).await.unwrap_err();
        assert_eq!(err.kind(), "no_match");
    }

    #[tokio::test]
    async fn open_breaker_is_tried_last() {
        let flaky = Scripted::new("flaky", 1, Script::Fail);
        let steady = Scripted::new("steady", 2, Script::Answer("ООО Ромашка", 0.8));
        let mut cfg = config(AggregationStrategy::FirstSuccess);
        cfg.breaker.failure_threshold = 2;
        let c = MultiProviderClassifier::new(vec![flaky.clone(), steady.clone()], &cfg);

        for _ in 0..2 {
            c.classify("ромашка", EntityType::Counterparty, &CancelSignal::never()).await.unwrap();
        }
        assert_eq!(c.health().state("flaky"), BreakerState::Open);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let result = c.classify("ромашка", EntityType::Counterparty, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.provider_used, "steady");
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn providers_cut_off_by_the_overall_deadline_trip_their_breaker() {
        let slow = Scripted::new("slow", 1, Script::Hang);
        let quick = Scripted::new("quick", 2, Script::Answer("Гайка М8", 0.9));
        let mut cfg = config(AggregationStrategy::BestConfidence);
        cfg.provider_timeout_ms = 5_000;
        cfg.overall_timeout_ms = 50;
        cfg.breaker.failure_threshold = 2;
        let c = MultiProviderClassifier::new(vec![slow.clone(), quick.clone()], &cfg);

        for _ in 0..2 {
            let result = c.classify("гайка м8", EntityType::Nomenclature, &CancelSignal::never()).await.unwrap();
            let cut = result.outcomes.iter().find(|o| o.provider == "slow").unwrap();
            assert_eq!(cut.error.as_deref(), Some("overall deadline exceeded"));
        }
        assert_eq!(c.health().state("slow"), BreakerState::Open);

        // The open breaker keeps the hanging provider out of the next fan-out.
        let result = c.classify("гайка м8", EntityType::Nomenclature, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.provider_used, "quick");
        assert!(result.outcomes.iter().all(|o| o.provider != "slow"));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_name_is_rejected_before_dispatch() {
        let p = Scripted::new("a", 1, Script::Answer("x", 1.0));
        let c = classifier(AggregationStrategy::FirstSuccess, vec![p.clone()]);
        let err = c.classify("  ", EntityType::Nomenclature, &CancelSignal::never()).await.unwrap_err();
        assert_eq!(err.kind(), "validation_failed");
        assert_eq!(p.calls.load(Ordering::SeqCst), 0);
    }
}
