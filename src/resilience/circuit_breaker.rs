use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

// Window slot bits. An all-zero slot has never been written.
const RECORDED: u8 = 0b001;
const FAILED: u8 = 0b010;
const SLOW: u8 = 0b100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => CLOSED,
            CircuitState::Open => OPEN,
            CircuitState::HalfOpen => HALF_OPEN,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub buffered_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    /// Percentage of failed calls, 0 when the window is empty.
    pub failure_rate: f32,
    pub slow_call_rate: f32,
}

/// Broadcast on every state change.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerTransition {
    pub dependency: String,
    pub from: CircuitState,
    pub to: CircuitState,
    /// Window as it was when the transition was decided.
    pub metrics: BreakerMetrics,
}

/// Count-based circuit breaker guarding one dependency.
///
/// All state lives in atomics: the mode, a ring of the last
/// `sliding_window_size` outcomes, the instant the breaker opened and the
/// half-open trial budget. Callers ask [`try_acquire`](Self::try_acquire)
/// before a call and report its outcome with [`record`](Self::record).
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    window: Box<[AtomicU8]>,
    cursor: AtomicUsize,
    epoch: Instant,
    opened_at_ms: AtomicU64,
    half_open_permits: AtomicU32,
    half_open_successes: AtomicU32,
    failure_rate_threshold: f32,
    slow_call_rate_threshold: f32,
    slow_call_duration: Duration,
    minimum_calls: u32,
    wait_in_open: Duration,
    permitted_in_half_open: u32,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        let size = config.sliding_window_size.max(1);
        let window = (0..size).map(|_| AtomicU8::new(0)).collect();
        let (transitions, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            state: AtomicU8::new(CLOSED),
            window,
            cursor: AtomicUsize::new(0),
            epoch: Instant::now(),
            opened_at_ms: AtomicU64::new(0),
            half_open_permits: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            failure_rate_threshold: config.failure_rate_threshold as f32,
            slow_call_rate_threshold: config.slow_call_rate_threshold as f32,
            slow_call_duration: config.slow_call_duration(),
            minimum_calls: config.minimum_number_of_calls.clamp(1, size) as u32,
            wait_in_open: config.wait_duration_in_open_state(),
            permitted_in_half_open: config.permitted_number_of_calls_in_half_open_state.max(1),
            transitions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Whether a call may go out now. An OPEN breaker whose wait has elapsed
    /// moves to HALF_OPEN here; HALF_OPEN hands out at most the permitted
    /// number of trial calls.
    pub fn try_acquire(&self) -> bool {
        loop {
            match self.state.load(Ordering::Acquire) {
                CLOSED => return true,
                OPEN => {
                    let opened = self.opened_at_ms.load(Ordering::Acquire);
                    if self.now_ms().saturating_sub(opened) < self.wait_in_open.as_millis() as u64 {
                        return false;
                    }
                    self.transition(CircuitState::Open, CircuitState::HalfOpen);
                    // Re-read: either we or a racing caller moved it on.
                }
                _ => {
                    return self
                        .half_open_permits
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1))
                        .is_ok();
                }
            }
        }
    }

    /// Report the outcome of a call that was let through.
    pub fn record(&self, failed: bool, elapsed: Duration) {
        let slow = elapsed >= self.slow_call_duration;
        match self.state() {
            CircuitState::Closed => {
                let mut code = RECORDED;
                if failed {
                    code |= FAILED;
                }
                if slow {
                    code |= SLOW;
                }
                let slot = self.cursor.fetch_add(1, Ordering::AcqRel) % self.window.len();
                self.window[slot].store(code, Ordering::Release);

                let metrics = self.metrics();
                if metrics.buffered_calls >= self.minimum_calls
                    && (metrics.failure_rate >= self.failure_rate_threshold
                        || metrics.slow_call_rate >= self.slow_call_rate_threshold)
                {
                    self.transition(CircuitState::Closed, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                if failed {
                    self.transition(CircuitState::HalfOpen, CircuitState::Open);
                    return;
                }
                let done = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if done >= self.permitted_in_half_open {
                    self.transition(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            // Late results of calls started before the breaker opened.
            CircuitState::Open => {}
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let (mut buffered, mut failed, mut slow) = (0u32, 0u32, 0u32);
        for slot in self.window.iter() {
            let code = slot.load(Ordering::Acquire);
            if code & RECORDED == 0 {
                continue;
            }
            buffered += 1;
            if code & FAILED != 0 {
                failed += 1;
            }
            if code & SLOW != 0 {
                slow += 1;
            }
        }
        let rate = |n: u32| {
            if buffered == 0 {
                0.0
            } else {
                n as f32 * 100.0 / buffered as f32
            }
        };
        BreakerMetrics {
            state: self.state(),
            buffered_calls: buffered,
            failed_calls: failed,
            slow_calls: slow,
            failure_rate: rate(failed),
            slow_call_rate: rate(slow),
        }
    }

    /// Force CLOSED with an empty window.
    pub fn reset(&self) {
        let from = self.state();
        if from == CircuitState::Closed {
            self.clear_window();
        } else {
            self.transition(from, CircuitState::Closed);
        }
    }

    /// Force OPEN, restarting the wait.
    pub fn force_open(&self) {
        let from = self.state();
        if from == CircuitState::Open {
            self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        } else {
            self.transition(from, CircuitState::Open);
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn clear_window(&self) {
        for slot in self.window.iter() {
            slot.store(0, Ordering::Release);
        }
        self.cursor.store(0, Ordering::Release);
    }

    /// Move `from -> to` if nobody else did first. Returns whether this call
    /// performed the transition.
    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let metrics = self.metrics();
        if to == CircuitState::Open {
            // Before the swap so no caller sees OPEN with a stale timestamp.
            self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        }
        if self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match to {
            CircuitState::Open => {
                self.half_open_permits.store(0, Ordering::Release);
                warn!(
                    dependency = %self.name,
                    %from,
                    %to,
                    failure_rate = metrics.failure_rate,
                    slow_call_rate = metrics.slow_call_rate,
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                self.half_open_successes.store(0, Ordering::Release);
                self.half_open_permits
                    .store(self.permitted_in_half_open, Ordering::Release);
                info!(dependency = %self.name, %from, %to, "circuit breaker half-open");
            }
            CircuitState::Closed => {
                self.half_open_permits.store(0, Ordering::Release);
                info!(dependency = %self.name, %from, %to, "circuit breaker closed");
            }
        }
        self.clear_window();

        let _ = self.transitions.send(BreakerTransition {
            dependency: self.name.clone(),
            from,
            to,
            metrics: BreakerMetrics {
                state: to,
                ..metrics
            },
        });
        true
    }
}
