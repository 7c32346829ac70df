//! Per-source request admission: token bucket plus sliding window.
//!
//! Each source gets two bounds:
//!
//! - a **token bucket** (capacity `B`, refill `R` tokens/s) limiting
//!   short-term bursts;
//! - a **sliding window** counter (at most `W` requests per rolling `T`)
//!   matching the quota the upstream API actually enforces.
//!
//! [`RateGate::acquire`] consults both. When either bound would deny, it
//! computes the earliest instant both would admit; if that fits inside the
//! caller's deadline it sleeps and then commits, otherwise it returns
//! [`FetchError::DeadlineExceeded`] without consuming anything.
//!
//! Upstream 429 responses are fed back via [`RateGate::penalize`], which
//! drains the bucket and pushes the next admit time out by the server's
//! `Retry-After`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{Config, RateGateConfig};
use crate::error::FetchError;
use crate::models::SourceId;

#[derive(Debug, Clone, Copy)]
struct Limits {
    burst: u32,
    refill_per_sec: f64,
    window_requests: usize,
    window: Duration,
}

impl Limits {
    fn from(base: &RateGateConfig) -> Self {
        Self {
            burst: base.burst,
            refill_per_sec: base.refill_per_sec,
            window_requests: base.window_requests,
            window: Duration::from_secs(base.window_secs),
        }
    }
}

struct SourceState {
    limits: Limits,
    /// Current token count; never negative, never above `burst`.
    tokens: f64,
    last_refill: Instant,
    /// Timestamps of admissions inside the rolling window.
    window: VecDeque<Instant>,
    /// Earliest instant the next request may be admitted (429 feedback).
    not_before: Option<Instant>,
}

impl SourceState {
    fn new(limits: Limits) -> Self {
        Self {
            limits,
            tokens: limits.burst as f64,
            last_refill: Instant::now(),
            window: VecDeque::new(),
            not_before: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.limits.refill_per_sec)
            .min(self.limits.burst as f64);
        self.last_refill = now;
    }

    fn prune_window(&mut self, now: Instant) {
        while let Some(&front) = self.window.front() {
            if now.duration_since(front) >= self.limits.window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Delay until both bounds would admit one request, `ZERO` if admissible
    /// now. Does not consume anything.
    fn delay_until_admit(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.prune_window(now);

        let mut delay = Duration::ZERO;

        if let Some(nb) = self.not_before {
            if nb > now {
                delay = delay.max(nb - now);
            } else {
                self.not_before = None;
            }
        }

        if self.tokens < 1.0 {
            let missing = 1.0 - self.tokens;
            delay = delay.max(Duration::from_secs_f64(missing / self.limits.refill_per_sec));
        }

        if self.window.len() >= self.limits.window_requests {
            // The oldest in-window admission must age out first.
            let oldest = self.window[self.window.len() - self.limits.window_requests];
            let expires = oldest + self.limits.window;
            if expires > now {
                delay = delay.max(expires - now);
            }
        }

        delay
    }

    /// Consume one admission. Caller must have verified admissibility.
    fn commit(&mut self, now: Instant) {
        self.tokens = (self.tokens - 1.0).max(0.0);
        self.window.push_back(now);
    }
}

/// Per-source admission gate. One per process, shared across queries.
pub struct RateGate {
    states: HashMap<SourceId, Mutex<SourceState>>,
}

impl RateGate {
    /// Build a gate for every source, applying per-source overrides from
    /// `[sources.<name>]` on top of the `[rategate]` defaults.
    pub fn from_config(config: &Config) -> Self {
        let mut states = HashMap::new();
        for id in SourceId::ALL {
            let mut limits = Limits::from(&config.rategate);
            if let Some(sc) = config.sources.get(id.as_str()) {
                if let Some(b) = sc.burst {
                    limits.burst = b;
                }
                if let Some(r) = sc.refill_per_sec {
                    limits.refill_per_sec = r;
                }
                if let Some(w) = sc.window_requests {
                    limits.window_requests = w;
                }
                if let Some(t) = sc.window_secs {
                    limits.window = Duration::from_secs(t);
                }
            }
            states.insert(id, Mutex::new(SourceState::new(limits)));
        }
        Self { states }
    }

    /// Admit one request to `source`, sleeping if necessary.
    ///
    /// Returns `Ok(())` once admitted, or [`FetchError::DeadlineExceeded`]
    /// when admission cannot happen before `deadline`.
    pub async fn acquire(&self, source: SourceId, deadline: Instant) -> Result<(), FetchError> {
        loop {
            let now = Instant::now();
            let delay = {
                let mut state = self.states[&source].lock().unwrap();
                let delay = state.delay_until_admit(now);
                if delay.is_zero() {
                    state.commit(now);
                    return Ok(());
                }
                delay
            };

            if now + delay > deadline {
                debug!(source = %source, ?delay, "rate gate cannot admit before deadline");
                return Err(FetchError::DeadlineExceeded);
            }
            tokio::time::sleep(delay).await;
            // Re-check under the lock: another task may have taken the slot.
        }
    }

    /// Feed back an upstream 429: drain the bucket and push the next admit
    /// time out by `retry_after`.
    pub fn penalize(&self, source: SourceId, retry_after: Duration) {
        let mut state = self.states[&source].lock().unwrap();
        state.tokens = 0.0;
        let until = Instant::now() + retry_after;
        state.not_before = Some(state.not_before.map_or(until, |nb| nb.max(until)));
        debug!(source = %source, ?retry_after, "rate gate penalized");
    }

    /// Snapshot of remaining window quota, for the sources listing.
    pub fn remaining(&self, source: SourceId) -> usize {
        let mut state = self.states[&source].lock().unwrap();
        let now = Instant::now();
        state.prune_window(now);
        state.limits.window_requests.saturating_sub(state.window.len())
    }

    #[cfg(test)]
    fn tokens(&self, source: SourceId) -> f64 {
        let mut state = self.states[&source].lock().unwrap();
        state.refill(Instant::now());
        state.tokens
    }
}
