//! Quota prefetch: a per-quota-name predictive allocator.
//!
//! The hardest algorithm in the core. Amortizes server round trips by
//! predicting future demand from a sliding window of recent grants,
//! speculatively topping up `available` tokens ahead of need, and adjusting
//! the prediction with additive-increase/multiplicative-decrease feedback
//! from how much the server actually grants.

pub mod cache;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::QuotaOptions;

/// A prefetch request topping up the local token pool. Returns `None` on
/// transport failure — quota decisions fail open, so the caller treats
/// `None` as a full grant of the requested amount.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Bound at construction time to a specific (quota name, attributes) class;
/// invoked by [`QuotaPrefetch`] whenever it decides to top up.
pub type AllocFn = Arc<dyn Fn(i64) -> BoxFuture<Option<(i64, Duration)>> + Send + Sync>;

/// Round-trip-time safety margin folded into the prefetch target:
/// `rate × (round_trip_time + safety_margin)`.
const SAFETY_MARGIN: Duration = Duration::from_millis(25);
/// Fallback RTT estimate before any Alloc has completed.
const INITIAL_RTT: Duration = Duration::from_millis(50);
/// Additive-increase step applied to the predicted amount on a full grant.
const ADDITIVE_STEP_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, Copy)]
struct GrantRecord {
    at: Instant,
    granted: i64,
}

#[derive(Debug, Clone, Copy)]
struct ExpiringGrant {
    expire_at: Instant,
    amount: i64,
}

struct State {
    available: i64,
    last_request_time: Option<Instant>,
    in_flight: bool,
    /// Amount asked for in the currently in-flight Alloc; the ceiling on
    /// cumulative optimistic grants for this window.
    in_flight_ask: i64,
    /// Sum of amounts already optimistically granted against `in_flight_ask`
    /// since the in-flight Alloc was issued. Reset whenever a window opens
    /// or closes.
    optimistically_granted: i64,
    window: VecDeque<GrantRecord>,
    expiring: VecDeque<ExpiringGrant>,
    predicted_amount: i64,
    last_rtt: Duration,
}

impl State {
    fn new(options: &QuotaOptions) -> Self {
        Self {
            available: 0,
            last_request_time: None,
            in_flight: false,
            in_flight_ask: 0,
            optimistically_granted: 0,
            window: VecDeque::with_capacity(options.prefetch_window),
            expiring: VecDeque::new(),
            predicted_amount: options.prefetch_min,
            last_rtt: INITIAL_RTT,
        }
    }

    /// Discard tokens whose grant has expired, decaying `available`
    /// accordingly.
    fn decay(&mut self, now: Instant) {
        while let Some(front) = self.expiring.front() {
            if front.expire_at > now {
                break;
            }
            let expired = self.expiring.pop_front().unwrap();
            self.available = (self.available - expired.amount).max(0);
        }
    }

    fn estimated_rate(&self) -> f64 {
        match (self.window.front(), self.window.back()) {
            (Some(first), Some(last)) if last.at > first.at => {
                let span = (last.at - first.at).as_secs_f64();
                let total: i64 = self.window.iter().map(|r| r.granted).sum();
                total as f64 / span
            }
            _ => 0.0,
        }
    }

    fn prefetch_target(&self, options: &QuotaOptions) -> i64 {
        let rate = self.estimated_rate();
        let target = rate * (self.last_rtt + SAFETY_MARGIN).as_secs_f64();
        (target.ceil() as i64).max(options.prefetch_min)
    }

    fn record_grant(&mut self, now: Instant, granted: i64, expire: Duration, options: &QuotaOptions) {
        self.window.push_back(GrantRecord { at: now, granted });
        while self.window.len() > options.prefetch_window {
            self.window.pop_front();
        }
        if granted > 0 {
            self.expiring.push_back(ExpiringGrant {
                expire_at: now + expire,
                amount: granted,
            });
        }
        self.available += granted;
    }
}

/// A single named quota's predictive allocator.
///
/// Accessed concurrently from the request hot path and the transport
/// completion callback; a single mutex guards the O(window size) critical
/// section.
pub struct QuotaPrefetch {
    state: Mutex<State>,
    options: QuotaOptions,
    alloc: AllocFn,
}

impl QuotaPrefetch {
    pub fn new(options: QuotaOptions, alloc: AllocFn) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::new(&options)),
            options,
            alloc,
        })
    }

    /// Returns `true` if `amount` may be granted locally, possibly firing an
    /// asynchronous top-up first. Never blocks the caller.
    ///
    /// Invariant: `available` is only ever decremented when it already
    /// covers `amount` in full, so it never goes negative on this path. An
    /// optimistic best-effort grant (the prefetch-in-flight branch) does not
    /// touch `available` at all — it trades a bounded, documented over-grant
    /// risk for never violating that invariant. That risk is itself capped:
    /// the running total of optimistic grants made while one Alloc is in
    /// flight never exceeds the amount asked for in that Alloc, so a whole
    /// RTT window can over-grant by at most `in_flight_ask`, not by an
    /// unbounded number of concurrent Check calls.
    pub fn check(self: &Arc<Self>, amount: i64, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.decay(now);

        if state.available >= amount {
            state.available -= amount;
            return true;
        }

        let target = state.prefetch_target(&self.options);
        let ask = state.predicted_amount.max(self.options.prefetch_min).max(amount);

        if !state.in_flight {
            state.in_flight = true;
            state.in_flight_ask = ask;
            state.optimistically_granted = 0;
            state.last_request_time = Some(now);
            let this = self.clone();
            let fut = (self.alloc)(ask);
            tokio::spawn(async move {
                let outcome = fut.await;
                this.on_alloc_done(outcome, ask);
            });
        }

        let within_amount_budget = amount <= target.max(state.predicted_amount);
        let within_window_cap =
            state.optimistically_granted.saturating_add(amount) <= state.in_flight_ask;
        let can_optimistically_grant = within_amount_budget && within_window_cap;
        if can_optimistically_grant {
            state.optimistically_granted += amount;
        }

        tracing::trace!(
            amount,
            ask,
            optimistically_granted = state.optimistically_granted,
            in_flight_ask = state.in_flight_ask,
            can_optimistically_grant,
            "quota prefetch miss"
        );
        can_optimistically_grant
    }

    fn on_alloc_done(self: &Arc<Self>, outcome: Option<(i64, Duration)>, requested: i64) {
        let now = Instant::now();
        let mut state = self.state.lock();

        let (granted, expire) = outcome.unwrap_or((requested, self.options.expiration()));

        if let Some(req_at) = state.last_request_time {
            state.last_rtt = now.saturating_duration_since(req_at).max(Duration::from_millis(1));
        }

        // Additive-increase/multiplicative-decrease on the predicted amount:
        // full grant -> grow, partial grant -> shrink.
        if granted >= requested {
            let step = ((state.predicted_amount as f64) * ADDITIVE_STEP_FRACTION).ceil() as i64;
            state.predicted_amount = (state.predicted_amount + step.max(1)).max(self.options.prefetch_min);
        } else {
            state.predicted_amount = (state.predicted_amount / 2).max(self.options.prefetch_min);
        }

        state.record_grant(now, granted, expire, &self.options);
        state.in_flight = false;
        state.in_flight_ask = 0;
        state.optimistically_granted = 0;
    }
}
