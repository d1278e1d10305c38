//! Error recovery engine
//!
//! Per-context retry state with jittered exponential backoff, a circuit
//! breaker per context key, and a classified strategy catalog. The engine is
//! strategy-agnostic: it decides whether to retry and after how long, and
//! hands back an action hint the caller interprets (refresh the connection,
//! increase a timeout, clean up storage, ...).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RecoveryConfig;
use crate::errors::{StoreError, StoreResult};

/// Floor applied to every computed backoff delay
const MIN_DELAY: Duration = Duration::from_millis(100);

/// Action hint returned with a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Tear down and re-establish the transport connection
    RefreshConnection,
    /// Retry with a longer operation timeout
    IncreaseTimeout,
    /// Plain wait; the server asked us to slow down
    Backoff,
    /// Reopen the metadata database connection
    ReconnectDatabase,
    /// Reclaim disk space before retrying
    CleanupStorage,
    /// No special preparation needed
    None,
}

/// Decision returned by `handle_error`
#[derive(Debug)]
pub enum RecoveryDecision {
    /// Retry after `delay`, preparing per `action`
    Retry {
        /// How long to wait before the next attempt
        delay: Duration,
        /// Preparation hint for the caller
        action: RecoveryAction,
    },
    /// Give up; the original error comes back to the caller
    Fail(StoreError),
}

/// Circuit breaker state for one context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Failing fast; no calls go through until the timeout elapses
    Open,
    /// One probe is in flight after the timeout
    HalfOpen,
}

/// One entry in the strategy catalog
struct RecoveryStrategy {
    name: &'static str,
    action: RecoveryAction,
    matches: fn(&StoreError) -> bool,
}

/// Catalog order matters: the first matching strategy wins
static STRATEGIES: &[RecoveryStrategy] = &[
    RecoveryStrategy {
        name: "network",
        action: RecoveryAction::RefreshConnection,
        matches: |e| {
            matches!(e, StoreError::Network(_))
                || matches_message(e, &["connection", "network", "reset", "broken pipe"])
        },
    },
    RecoveryStrategy {
        name: "timeout",
        action: RecoveryAction::IncreaseTimeout,
        matches: |e| matches!(e, StoreError::Timeout(_)) || matches_message(e, &["timed out"]),
    },
    RecoveryStrategy {
        name: "rate_limit",
        action: RecoveryAction::Backoff,
        matches: |e| {
            matches!(e, StoreError::RateLimit(_)) || matches_message(e, &["429", "rate limit"])
        },
    },
    RecoveryStrategy {
        name: "database_transient",
        action: RecoveryAction::ReconnectDatabase,
        matches: |e| {
            matches!(e, StoreError::Database(_))
                && matches_message(e, &["locked", "busy", "interrupted"])
        },
    },
    RecoveryStrategy {
        name: "storage_temporary",
        action: RecoveryAction::CleanupStorage,
        matches: |e| {
            matches!(e, StoreError::Io(_))
                && matches_message(e, &["no space", "too many open files", "resource temporarily"])
        },
    },
    RecoveryStrategy {
        name: "default",
        action: RecoveryAction::None,
        matches: |_| true,
    },
];

fn matches_message(error: &StoreError, needles: &[&str]) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    needles.iter().any(|needle| message.contains(needle))
}

/// Per-context mutable state
#[derive(Debug)]
struct ContextState {
    attempt_count: u32,
    last_attempt: Instant,
    breaker: BreakerState,
    consecutive_failures: u32,
    opened_at: Instant,
}

impl ContextState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            attempt_count: 0,
            last_attempt: now,
            breaker: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: now,
        }
    }
}

/// Retry and circuit-breaker engine
///
/// Context keys are opaque caller-chosen strings (e.g. `fetch:<message_id>`).
/// State mutations per key are serialized; distinct keys are independent.
pub struct RecoveryEngine {
    config: RecoveryConfig,
    contexts: Mutex<HashMap<String, ContextState>>,
}

impl RecoveryEngine {
    /// Create an engine with the given policy
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Classify an error and decide whether to retry
    ///
    /// An open breaker fails fast without consulting the catalog. Otherwise
    /// the failure is recorded, the first matching strategy is selected, and
    /// a retry is granted while the error is recoverable and attempts
    /// remain. The delay grows as `base * multiplier^attempt`, capped at the
    /// maximum, jittered, and floored at 100 ms.
    pub fn handle_error(&self, error: StoreError, context: &str) -> RecoveryDecision {
        let mut contexts = match self.contexts.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return RecoveryDecision::Fail(StoreError::Internal(
                    "recovery state mutex poisoned".to_owned(),
                ));
            }
        };
        let state = contexts
            .entry(context.to_owned())
            .or_insert_with(ContextState::new);

        let breaker_timeout = Duration::from_millis(self.config.breaker_timeout_ms);
        match state.breaker {
            BreakerState::Open if state.opened_at.elapsed() < breaker_timeout => {
                return RecoveryDecision::Fail(StoreError::CircuitBreakerOpen(context.to_owned()));
            }
            BreakerState::Open => {
                // Timeout elapsed; this failure belongs to the pre-probe era.
                state.breaker = BreakerState::HalfOpen;
            }
            BreakerState::HalfOpen => {
                // The probe itself failed; reopen and fail fast.
                state.breaker = BreakerState::Open;
                state.opened_at = Instant::now();
                warn!(context, "half-open probe failed; breaker reopened");
                return RecoveryDecision::Fail(StoreError::CircuitBreakerOpen(context.to_owned()));
            }
            BreakerState::Closed => {}
        }

        state.consecutive_failures += 1;
        if state.breaker == BreakerState::Closed
            && state.consecutive_failures >= self.config.breaker_threshold
        {
            state.breaker = BreakerState::Open;
            state.opened_at = Instant::now();
            warn!(
                context,
                failures = state.consecutive_failures,
                "circuit breaker opened"
            );
        }

        let strategy = STRATEGIES
            .iter()
            .find(|s| (s.matches)(&error))
            .unwrap_or(&STRATEGIES[STRATEGIES.len() - 1]);

        if error.is_potentially_recoverable() && state.attempt_count < self.config.max_retries {
            let delay = self.backoff_delay(state.attempt_count);
            state.attempt_count += 1;
            state.last_attempt = Instant::now();
            debug!(
                context,
                strategy = strategy.name,
                attempt = state.attempt_count,
                delay_ms = delay.as_millis() as u64,
                "retry scheduled"
            );
            RecoveryDecision::Retry {
                delay,
                action: strategy.action,
            }
        } else {
            debug!(context, strategy = strategy.name, "retries exhausted");
            RecoveryDecision::Fail(error)
        }
    }

    /// Record a success: attempts reset, the breaker closes
    pub fn record_success(&self, context: &str) {
        if let Ok(mut contexts) = self.contexts.lock()
            && let Some(state) = contexts.get_mut(context)
        {
            state.attempt_count = 0;
            state.consecutive_failures = 0;
            state.breaker = BreakerState::Closed;
        }
    }

    /// Whether the breaker currently admits a call for this context
    ///
    /// An open breaker past its timeout transitions to half-open and admits
    /// exactly one probe; further calls are refused until that probe
    /// resolves through `record_success` or `handle_error`.
    pub fn probe_allowed(&self, context: &str) -> bool {
        let Ok(mut contexts) = self.contexts.lock() else {
            return false;
        };
        let state = contexts
            .entry(context.to_owned())
            .or_insert_with(ContextState::new);
        match state.breaker {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                if state.opened_at.elapsed() >= Duration::from_millis(self.config.breaker_timeout_ms)
                {
                    state.breaker = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Current breaker state for a context
    pub fn breaker_state(&self, context: &str) -> BreakerState {
        self.contexts
            .lock()
            .ok()
            .and_then(|contexts| contexts.get(context).map(|s| s.breaker))
            .unwrap_or(BreakerState::Closed)
    }

    /// Attempts consumed so far for a context
    pub fn attempt_count(&self, context: &str) -> u32 {
        self.contexts
            .lock()
            .ok()
            .and_then(|contexts| contexts.get(context).map(|s| s.attempt_count))
            .unwrap_or(0)
    }

    /// Retry state for a context: attempts consumed and last attempt time
    pub fn retry_state(&self, context: &str) -> Option<(u32, Instant)> {
        self.contexts
            .lock()
            .ok()
            .and_then(|contexts| {
                contexts
                    .get(context)
                    .map(|s| (s.attempt_count, s.last_attempt))
            })
    }

    /// Drop all state for a context
    pub fn reset(&self, context: &str) {
        if let Ok(mut contexts) = self.contexts.lock() {
            contexts.remove(context);
        }
    }

    /// Run an operation under this engine's retry policy
    ///
    /// Retries per `handle_error` decisions, sleeping the granted delay
    /// between attempts. Success resets the context.
    pub async fn run_with_retry<T, F, Fut>(&self, context: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        loop {
            if !self.probe_allowed(context) {
                return Err(StoreError::CircuitBreakerOpen(context.to_owned()));
            }
            match op().await {
                Ok(value) => {
                    self.record_success(context);
                    return Ok(value);
                }
                Err(error) => match self.handle_error(error, context) {
                    RecoveryDecision::Retry { delay, .. } => {
                        tokio::time::sleep(delay).await;
                    }
                    RecoveryDecision::Fail(error) => return Err(error),
                },
            }
        }
    }

    /// Compute the jittered backoff delay for an attempt index
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let exponential = base * self.config.multiplier.powi(attempt as i32);
        let capped = exponential.min(self.config.max_delay_ms as f64);
        let jittered = if self.config.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(-self.config.jitter..=self.config.jitter);
            capped * (1.0 + factor)
        } else {
            capped
        };
        Duration::from_millis(jittered as u64).max(MIN_DELAY)
    }
}
