use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    /// Deprioritized until the cool-down elapses
    Open,
    /// Cool-down elapsed; trial calls decide whether to close again
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_successes: usize,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            trial_successes: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.failures.clear();
        self.trial_successes = 0;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthSnapshot {
    pub provider: String,
    pub state: BreakerState,
    pub recent_failures: usize,
}

/// Per-provider soft circuit breakers with rolling failure windows
#[derive(Debug)]
pub struct ProviderHealth {
    failure_threshold: usize,
    window: Duration,
    cooldown: Duration,
    half_open_successes: usize,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl ProviderHealth {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            window: Duration::from_secs(config.failure_window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
            half_open_successes: config.half_open_successes.max(1),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Breaker>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self, provider: &str) -> BreakerState {
        self.state_at(provider, Instant::now())
    }

    pub fn state_at(&self, provider: &str, now: Instant) -> BreakerState {
        let mut breakers = self.lock();
        let breaker = breakers.entry(provider.to_string()).or_insert_with(Breaker::new);
        self.refresh(provider, breaker, now);
        breaker.state
    }

    /// Open breakers are tried last, never skipped outright
    pub fn is_deprioritized(&self, provider: &str) -> bool {
        self.state(provider) == BreakerState::Open
    }

    fn refresh(&self, provider: &str, breaker: &mut Breaker, now: Instant) {
        if breaker.state == BreakerState::Open {
            let elapsed = breaker
                .opened_at
                .map_or(self.cooldown, |at| now.saturating_duration_since(at));
            if elapsed >= self.cooldown {
                info!(provider, "Circuit breaker half-open after cool-down");
                breaker.state = BreakerState::HalfOpen;
                breaker.trial_successes = 0;
            }
        }
        while let Some(&oldest) = breaker.failures.front() {
            if now.saturating_duration_since(oldest) > self.window {
                breaker.failures.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_success(&self, provider: &str) {
        self.record_success_at(provider, Instant::now())
    }

    pub fn record_success_at(&self, provider: &str, now: Instant) {
        let mut breakers = self.lock();
        let breaker = breakers.entry(provider.to_string()).or_insert_with(Breaker::new);
        self.refresh(provider, breaker, now);
        match breaker.state {
            BreakerState::Closed => {}
            BreakerState::Open | BreakerState::HalfOpen => {
                breaker.state = BreakerState::HalfOpen;
                breaker.trial_successes += 1;
                if breaker.trial_successes >= self.half_open_successes {
                    info!(provider, "Circuit breaker closed");
                    breaker.state = BreakerState::Closed;
                    breaker.failures.clear();
                    breaker.opened_at = None;
                    breaker.trial_successes = 0;
                }
            }
        }
    }

    /// Returns true when this failure opened the breaker
    pub fn record_failure(&self, provider: &str) -> bool {
        self.record_failure_at(provider, Instant::now())
    }

    pub fn record_failure_at(&self, provider: &str, now: Instant) -> bool {
        let mut breakers = self.lock();
        let breaker = breakers.entry(provider.to_string()).or_insert_with(Breaker::new);
        self.refresh(provider, breaker, now);
        match breaker.state {
            BreakerState::Closed => {
                breaker.failures.push_back(now);
                if breaker.failures.len() >= self.failure_threshold {
                    warn!(provider, failures = breaker.failures.len(), "Circuit breaker opened");
                    breaker.open(now);
                    metrics::classifier::breaker_opened(provider);
                    return true;
                }
                false
            }
            BreakerState::HalfOpen => {
                warn!(provider, "Trial call failed, circuit breaker re-opened");
                breaker.open(now);
                metrics::classifier::breaker_opened(provider);
                true
            }
            BreakerState::Open => {
                breaker.opened_at = Some(now);
                false
            }
        }
    }

    pub fn snapshot(&self) -> Vec<ProviderHealthSnapshot> {
        let now = Instant::now();
        let mut breakers = self.lock();
        let mut out: Vec<ProviderHealthSnapshot> = breakers
            .iter_mut()
            .map(|(provider, breaker)| {
                self.refresh(provider, breaker, now);
                ProviderHealthSnapshot {
                    provider: provider.clone(),
                    state: breaker.state,
                    recent_failures: breaker.failures.len(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }
}
