use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{call_provider, CallContext, Classification, ProviderOutcome};
use crate::app::ports::{ClassificationProvider, ProviderAnswer};
use crate::domain::EntityType;
use crate::error::{PipelineError, Result};
use crate::observability::metrics;
use crate::pipeline::processing::similarity::normalize_key;

/// Policy for combining provider answers into one result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationStrategy {
    /// Providers in priority order, stop at the first usable answer
    FirstSuccess,
    /// All providers in parallel, most common normalized form wins
    MajorityVote,
    /// All providers in parallel, highest confidence wins
    BestConfidence,
}

impl AggregationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationStrategy::FirstSuccess => "first-success",
            AggregationStrategy::MajorityVote => "majority-vote",
            AggregationStrategy::BestConfidence => "best-confidence",
        }
    }

    /// Query `providers` (already in dispatch order) and aggregate their answers
    pub(crate) async fn classify(
        &self,
        providers: &[Arc<dyn ClassificationProvider>],
        name: &str,
        entity_type: EntityType,
        ctx: &CallContext,
    ) -> Result<Classification> {
        let started = Instant::now();
        let outcomes = match self {
            AggregationStrategy::FirstSuccess => sequential(providers, name, entity_type, ctx).await,
            AggregationStrategy::MajorityVote | AggregationStrategy::BestConfidence => {
                parallel(providers, name, entity_type, ctx).await
            }
        };

        let usable: Vec<(usize, &ProviderAnswer)> = outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.answer.as_ref().map(|a| (i, a)))
            .filter(|(_, a)| !a.normalized_name.trim().is_empty())
            .collect();
        let successes = outcomes.iter().filter(|o| o.answer.is_some()).count();
        let failures = outcomes.len() - successes;

        if usable.is_empty() {
            return Err(if successes > 0 {
                PipelineError::NoMatch(format!("no provider could normalize '{}'", name))
            } else {
                PipelineError::ProviderUnavailable(format!(
                    "all {} provider(s) failed for '{}'",
                    outcomes.len(),
                    name
                ))
            });
        }

        let (winner, confidence) = match self {
            AggregationStrategy::FirstSuccess => (usable[0].0, usable[0].1.confidence),
            AggregationStrategy::MajorityVote => majority(&usable),
            AggregationStrategy::BestConfidence => best_confidence(&usable),
        };
        let answer = outcomes[winner]
            .answer
            .clone()
            .ok_or_else(|| PipelineError::internal("winning outcome has no answer"))?;
        let provider_used = outcomes[winner].provider.clone();

        Ok(Classification {
            normalized_name: answer.normalized_name.trim().to_string(),
            category: answer.category,
            confidence: confidence.clamp(0.0, 1.0),
            provider_used,
            strategy: *self,
            successes,
            failures,
            outcomes,
            duration: started.elapsed(),
        })
    }
}

async fn sequential(
    providers: &[Arc<dyn ClassificationProvider>],
    name: &str,
    entity_type: EntityType,
    ctx: &CallContext,
) -> Vec<ProviderOutcome> {
    let deadline = Instant::now() + ctx.overall_timeout;
    let mut outcomes = Vec::new();
    for provider in providers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(provider = provider.id(), "Overall classification deadline reached");
            outcomes.push(ProviderOutcome::failed(provider.id(), "overall deadline exceeded", Duration::ZERO));
            continue;
        }
        let outcome = call_provider(
            provider.clone(),
            ctx.health.clone(),
            name.to_string(),
            entity_type,
            ctx.provider_timeout.min(remaining),
            ctx.cancel.clone(),
        )
        .await;
        let usable = outcome
            .answer
            .as_ref()
            .map_or(false, |a| !a.normalized_name.trim().is_empty());
        outcomes.push(outcome);
        if usable {
            break;
        }
    }
    outcomes
}

async fn parallel(
    providers: &[Arc<dyn ClassificationProvider>],
    name: &str,
    entity_type: EntityType,
    ctx: &CallContext,
) -> Vec<ProviderOutcome> {
    let deadline = Instant::now() + ctx.overall_timeout;
    let mut set = JoinSet::new();
    for (idx, provider) in providers.iter().enumerate() {
        let fut = call_provider(
            provider.clone(),
            ctx.health.clone(),
            name.to_string(),
            entity_type,
            ctx.provider_timeout,
            ctx.cancel.clone(),
        );
        set.spawn(async move { (idx, fut.await) });
    }

    let mut slots: Vec<Option<ProviderOutcome>> = (0..providers.len()).map(|_| None).collect();
    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok((idx, outcome)))) => slots[idx] = Some(outcome),
            Ok(Some(Err(join_err))) => warn!("Provider task failed: {}", join_err),
            Ok(None) => break,
            Err(_) => {
                warn!("Overall classification deadline reached, abandoning slow providers");
                set.abort_all();
                break;
            }
        }
    }

    slots
        .into_iter()
        .zip(providers)
        .map(|(slot, provider)| {
            slot.unwrap_or_else(|| {
                // Abandoned at the deadline; counts as a provider timeout.
                let id = provider.id();
                if !ctx.cancel.is_cancelled() {
                    ctx.health.record_failure(id);
                }
                metrics::classifier::provider_call(id, ctx.overall_timeout.as_secs_f64(), false);
                ProviderOutcome::failed(id, "overall deadline exceeded", ctx.overall_timeout)
            })
        })
        .collect()
}

/// Most common normalized form; ties go to the larger summed confidence, then provider order.
/// Confidence is the agreement ratio among usable answers.
fn majority(usable: &[(usize, &ProviderAnswer)]) -> (usize, f64) {
    let mut groups: HashMap<String, (usize, f64, usize, usize, f64)> = HashMap::new();
    for &(idx, answer) in usable {
        let key = normalize_key(&answer.normalized_name);
        let entry = groups
            .entry(key)
            .or_insert((0, 0.0, idx, idx, f64::MIN));
        entry.0 += 1;
        entry.1 += answer.confidence;
        entry.2 = entry.2.min(idx);
        if answer.confidence > entry.4 {
            entry.3 = idx;
            entry.4 = answer.confidence;
        }
    }
    let mut ranked: Vec<(usize, f64, usize, usize)> = groups
        .into_values()
        .map(|(votes, summed, first, representative, _)| (votes, summed, first, representative))
        .collect();
    ranked.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.2.cmp(&b.2))
    });
    let (votes, _, _, representative) = ranked[0];
    debug!(votes, total = usable.len(), "Majority vote decided");
    (representative, votes as f64 / usable.len() as f64)
}

fn best_confidence(usable: &[(usize, &ProviderAnswer)]) -> (usize, f64) {
    let mut best = usable[0];
    for &candidate in &usable[1..] {
        if candidate.1.confidence > best.1.confidence {
            best = candidate;
        }
    }
    (best.0, best.1.confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(name: &str, confidence: f64) -> ProviderAnswer {
        ProviderAnswer {
            normalized_name: name.to_string(),
            category: None,
            confidence,
        }
    }

    #[test]
    fn majority_counts_normalized_forms() {
        let a = answer("Болт М6", 0.9);
        let b = answer("болт м6", 0.6);
        let c = answer("Болт М8", 0.99);
        let usable = vec![(0, &a), (1, &b), (2, &c)];
        let (winner, confidence) = majority(&usable);
        assert_eq!(winner, 0);
        assert!((confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn majority_tie_prefers_summed_confidence() {
        let a = answer("Гайка", 0.5);
        let b = answer("Шайба", 0.8);
        let usable = vec![(0, &a), (1, &b)];
        let (winner, confidence) = majority(&usable);
        assert_eq!(winner, 1);
        assert_eq!(confidence, 0.5);
    }

    #[test]
    fn best_confidence_keeps_first_on_tie() {
        let a = answer("x", 0.7);
        let b = answer("y", 0.7);
        let c = answer("z", 0.4);
        assert_eq!(best_confidence(&[(0, &a), (1, &b), (2, &c)]), (0, 0.7));
    }

    #[test]
    fn strategy_names_round_trip_through_serde() {
        let parsed: AggregationStrategy = serde_json::from_str("\"best-confidence\"").unwrap();
        assert_eq!(parsed, AggregationStrategy::BestConfidence);
        assert_eq!(parsed.as_str(), "best-confidence");
    }
}
