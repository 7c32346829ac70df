//! Per-source circuit breaker.
//!
//! One three-state machine per source: `CLOSED → OPEN → HALF_OPEN → CLOSED`.
//!
//! - **Closed**: calls pass. Outcomes are recorded in a rolling window; once
//!   the window holds at least `min_samples` outcomes and the failure rate
//!   reaches `failure_rate`, the circuit opens.
//! - **Open**: calls are rejected immediately with
//!   [`FetchError::Unavailable`]; after `cool_down` the next caller is let
//!   through as a half-open probe.
//! - **HalfOpen**: at most `probes` concurrent probes are admitted. All
//!   succeeding closes the circuit; any failure re-opens it with the
//!   cool-down doubled, capped at `cool_down_max`.
//!
//! What counts as a failure is decided by the caller via
//! [`FetchError::counts_for_breaker`]: timeouts, 5xx, and network errors do;
//! 429s feed the rate gate, other 4xx is a caller bug, and cancellations say
//! nothing about the source.
//!
//! State is process-wide per source and survives across queries, not across
//! restarts.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::FetchError;
use crate::models::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    state: CircuitState,
    /// `(when, failed)` outcomes inside the rolling window (closed state).
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    cool_down: Duration,
    /// Probes currently in flight (half-open state).
    inflight_probes: usize,
    /// Probes that must still succeed before the circuit closes.
    pending_probes: usize,
}

/// Permission to call through the breaker. Resolve it with
/// [`CircuitBreaker::record`] once the outcome is known.
///
/// A permit abandoned by an aborted task can strand a half-open probe slot;
/// the slot count is reset on every state transition, so a strand heals at
/// the next open/half-open edge.
#[must_use = "resolve the permit by calling record()"]
pub struct Permit {
    source: SourceId,
    probe: bool,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    states: HashMap<SourceId, Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let states = SourceId::ALL
            .iter()
            .map(|&id| {
                (
                    id,
                    Mutex::new(BreakerState {
                        state: CircuitState::Closed,
                        outcomes: VecDeque::new(),
                        opened_at: None,
                        cool_down: Duration::from_secs(config.cool_down_secs),
                        inflight_probes: 0,
                        pending_probes: 0,
                    }),
                )
            })
            .collect();
        Self { config, states }
    }

    /// Current state of a source's circuit, with the scheduled open→half-open
    /// transition applied.
    pub fn state(&self, source: SourceId) -> CircuitState {
        let mut s = self.states[&source].lock().unwrap();
        self.maybe_half_open(source, &mut s);
        s.state
    }

    /// Ask to call `source`. `Err(Unavailable)` while the circuit is open or
    /// the half-open probe quota is in use.
    pub fn try_acquire(&self, source: SourceId) -> Result<Permit, FetchError> {
        let mut s = self.states[&source].lock().unwrap();
        self.maybe_half_open(source, &mut s);

        match s.state {
            CircuitState::Closed => Ok(Permit {
                source,
                probe: false,
            }),
            CircuitState::Open => Err(FetchError::Unavailable),
            CircuitState::HalfOpen => {
                if s.inflight_probes < self.config.probes {
                    s.inflight_probes += 1;
                    Ok(Permit { source, probe: true })
                } else {
                    Err(FetchError::Unavailable)
                }
            }
        }
    }

    /// Resolve a permit with the call's outcome.
    pub fn record(&self, permit: Permit, outcome: Result<(), &FetchError>) {
        let failed = match outcome {
            Ok(()) => false,
            Err(e) if e.counts_for_breaker() => true,
            // Soft or client-side errors resolve the permit without counting.
            Err(_) => {
                if permit.probe {
                    let mut s = self.states[&permit.source].lock().unwrap();
                    s.inflight_probes = s.inflight_probes.saturating_sub(1);
                }
                return;
            }
        };

        let mut s = self.states[&permit.source].lock().unwrap();
        if permit.probe {
            s.inflight_probes = s.inflight_probes.saturating_sub(1);
            if failed {
                self.reopen(permit.source, &mut s, true);
            } else {
                s.pending_probes = s.pending_probes.saturating_sub(1);
                if s.pending_probes == 0 && s.state == CircuitState::HalfOpen {
                    info!(source = %permit.source, "circuit closed after successful probes");
                    s.state = CircuitState::Closed;
                    s.outcomes.clear();
                    s.cool_down = Duration::from_secs(self.config.cool_down_secs);
                }
            }
            return;
        }

        // Closed-state accounting.
        let now = Instant::now();
        s.outcomes.push_back((now, failed));
        let window = Duration::from_secs(self.config.window_secs);
        while let Some(&(t, _)) = s.outcomes.front() {
            if now.duration_since(t) >= window {
                s.outcomes.pop_front();
            } else {
                break;
            }
        }

        if s.state == CircuitState::Closed && s.outcomes.len() >= self.config.min_samples {
            let failures = s.outcomes.iter().filter(|(_, f)| *f).count();
            let rate = failures as f64 / s.outcomes.len() as f64;
            if rate >= self.config.failure_rate {
                self.reopen(permit.source, &mut s, false);
            }
        }
    }

    fn reopen(&self, source: SourceId, s: &mut BreakerState, double: bool) {
        if double {
            let max = Duration::from_secs(self.config.cool_down_max_secs);
            s.cool_down = (s.cool_down * 2).min(max);
        }
        warn!(source = %source, cool_down = ?s.cool_down, "circuit opened");
        s.state = CircuitState::Open;
        s.opened_at = Some(Instant::now());
        s.outcomes.clear();
        s.inflight_probes = 0;
        s.pending_probes = 0;
    }

    fn maybe_half_open(&self, source: SourceId, s: &mut BreakerState) {
        if s.state == CircuitState::Open {
            if let Some(opened) = s.opened_at {
                if opened.elapsed() >= s.cool_down {
                    info!(source = %source, "circuit half-open, probing");
                    s.state = CircuitState::HalfOpen;
                    s.inflight_probes = 0;
                    s.pending_probes = self.config.probes;
                }
            }
        }
    }
}
