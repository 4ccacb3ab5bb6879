//! Per-upstream circuit breaker.
//!
//! Each upstream service gets its own breaker so one dead service does not
//! slow down routing to the others. While open, requests for that upstream
//! are answered immediately with the upstream error envelope instead of
//! waiting out the forwarding timeout.
//!
//! ```text
//!   Closed ──(N consecutive failures)──► Open
//!     ▲                                   │ open_duration elapsed
//!     │ M probe successes                 ▼
//!     └──────────────────────────────  HalfOpen ──(probe fails)──► Open
//! ```
//!
//! In HalfOpen only one probe is in flight at a time; concurrent requests are
//! rejected until the probe reports back. The probe slot is held by a
//! [`CircuitPermit`]; dropping the permit without an outcome (the request was
//! cancelled) frees the slot for the next request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 half-open, 2 open.
    fn gauge(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
}

impl CircuitBreakerConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_failure_threshold.max(1),
            success_threshold: config.circuit_breaker_success_threshold.max(1),
            open_duration: config.circuit_breaker_open_duration,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    probe_successes: u32,
}

pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    probe_in_flight: AtomicBool,
}

/// Admission to forward one request. Report the outcome with
/// [`CircuitPermit::succeeded`] or [`CircuitPermit::failed`].
#[must_use]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    reported: bool,
}

impl CircuitPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub async fn succeeded(mut self) {
        self.reported = true;
        self.breaker.record_success().await;
    }

    pub async fn failed(mut self) {
        self.reported = true;
        self.breaker.record_failure().await;
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.reported {
            debug!(service = %self.breaker.service, "Probe abandoned, releasing slot");
            self.breaker.probe_in_flight.store(false, Ordering::Release);
        }
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                consecutive_failures: 0,
                probe_successes: 0,
            }),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    /// A permit if a request may be forwarded now. In HalfOpen the permit
    /// holds the single probe slot.
    pub async fn allow_request(&self) -> Option<CircuitPermit<'_>> {
        let mut s = self.state.lock().await;
        let probe = match s.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => {
                self.probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .ok()?;
                true
            }
            CircuitState::Open => {
                let expired = s
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.open_duration);
                if !expired {
                    return None;
                }
                s.state = CircuitState::HalfOpen;
                s.probe_successes = 0;
                self.probe_in_flight.store(true, Ordering::Release);
                info!(service = %self.service, "Circuit half-open, probing upstream");
                metrics::set_circuit_breaker_state(&self.service, CircuitState::HalfOpen.gauge());
                true
            }
        };
        Some(CircuitPermit {
            breaker: self,
            probe,
            reported: false,
        })
    }

    pub async fn record_success(&self) {
        let mut s = self.state.lock().await;
        match s.state {
            CircuitState::Closed => s.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                self.probe_in_flight.store(false, Ordering::Release);
                s.probe_successes += 1;
                debug!(service = %self.service, successes = s.probe_successes, "Probe succeeded");
                if s.probe_successes >= self.config.success_threshold {
                    s.state = CircuitState::Closed;
                    s.opened_at = None;
                    s.consecutive_failures = 0;
                    info!(service = %self.service, "Circuit closed, upstream recovered");
                    metrics::set_circuit_breaker_state(&self.service, CircuitState::Closed.gauge());
                }
            }
            // Response from a request admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut s = self.state.lock().await;
        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        service = %self.service,
                        failures = s.consecutive_failures,
                        open_for = ?self.config.open_duration,
                        "Circuit opened after consecutive upstream failures"
                    );
                    self.open(&mut s);
                }
            }
            CircuitState::HalfOpen => {
                warn!(service = %self.service, "Probe failed, circuit reopened");
                self.open(&mut s);
            }
            CircuitState::Open => s.opened_at = Some(Instant::now()),
        }
    }

    fn open(&self, s: &mut BreakerState) {
        s.state = CircuitState::Open;
        s.opened_at = Some(Instant::now());
        s.probe_successes = 0;
        self.probe_in_flight.store(false, Ordering::Release);
        metrics::record_circuit_breaker_open(&self.service);
        metrics::set_circuit_breaker_state(&self.service, CircuitState::Open.gauge());
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}
