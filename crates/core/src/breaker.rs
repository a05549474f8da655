use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::Clock;

/// Tuning knobs for a single circuit breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a CLOSED breaker into OPEN.
    pub failure_threshold: u32,
    /// Time an OPEN breaker waits before allowing a HALF_OPEN probe.
    pub reset_timeout: Duration,
    /// Upper bound on concurrent in-flight calls per endpoint.
    pub max_in_flight: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::seconds(30),
            max_in_flight: 5,
        }
    }
}

/// Breaker state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Admission decision returned by [`CircuitBreaker::may_admit`].
///
/// Modelled as a tagged result rather than an error so callers can branch
/// without exception-driven control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied { reason: DenialReason },
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Why an admission request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// The breaker is OPEN and the reset timeout has not elapsed.
    Open,
    /// The endpoint already has the maximum number of in-flight calls.
    Saturated,
}

impl DenialReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Saturated => "saturated",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    in_flight: u32,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            in_flight: 0,
        }
    }

    fn transition(&mut self, endpoint: &str, next: BreakerState) {
        if self.state == next {
            return;
        }
        info!(
            stage = "breaker",
            endpoint,
            from = self.state.as_str(),
            state = next.as_str(),
            failures = self.consecutive_failures,
            "circuit breaker state changed"
        );
        self.state = next;
    }
}

/// Per-endpoint failure tracker with a closed/open/half-open state machine.
#[derive(Clone)]
pub struct CircuitBreaker {
    endpoint: Arc<str>,
    core: Arc<Mutex<BreakerCore>>,
    config: BreakerConfig,
    clock: Clock,
}

impl CircuitBreaker {
    fn new(endpoint: &str, config: BreakerConfig, clock: Clock) -> Self {
        Self {
            endpoint: Arc::from(endpoint),
            core: Arc::new(Mutex::new(BreakerCore::new())),
            config,
            clock,
        }
    }

    /// Decides whether a new call to this endpoint may proceed.
    ///
    /// An OPEN breaker whose reset timeout has elapsed moves to HALF_OPEN as a
    /// side effect, admitting a single probe; while that probe is unresolved
    /// every other caller is refused. Admission is also refused independent of
    /// state when the in-flight count has reached the configured cap.
    pub fn may_admit(&self) -> Admission {
        let now = (self.clock)();
        let mut core = self.core.lock().expect("breaker state poisoned");

        if core.state == BreakerState::Open {
            let cooled_down = core
                .last_failure_at
                .map(|at| now - at > self.config.reset_timeout)
                .unwrap_or(true);
            if cooled_down {
                core.transition(&self.endpoint, BreakerState::HalfOpen);
            } else {
                return Admission::Denied {
                    reason: DenialReason::Open,
                };
            }
        }

        // HALF_OPEN allows exactly one probe at a time.
        if core.state == BreakerState::HalfOpen && core.in_flight > 0 {
            return Admission::Denied {
                reason: DenialReason::Open,
            };
        }

        if core.in_flight >= self.config.max_in_flight {
            return Admission::Denied {
                reason: DenialReason::Saturated,
            };
        }

        Admission::Admitted
    }

    /// Records that an admitted call has started.
    pub fn on_request_started(&self) {
        let mut core = self.core.lock().expect("breaker state poisoned");
        core.in_flight += 1;
    }

    /// Records a successful outcome for an in-flight call.
    pub fn on_success(&self) {
        let mut core = self.core.lock().expect("breaker state poisoned");
        core.in_flight = core.in_flight.saturating_sub(1);
        core.consecutive_failures = 0;
        if core.state == BreakerState::HalfOpen {
            core.transition(&self.endpoint, BreakerState::Closed);
        }
    }

    /// Records a failed outcome for an in-flight call.
    ///
    /// A HALF_OPEN probe failure reopens the breaker immediately; the failure
    /// counter is carried over rather than reset.
    pub fn on_failure(&self) {
        let now = (self.clock)();
        let mut core = self.core.lock().expect("breaker state poisoned");
        core.in_flight = core.in_flight.saturating_sub(1);
        core.consecutive_failures += 1;
        core.last_failure_at = Some(now);

        match core.state {
            BreakerState::HalfOpen => {
                warn!(
                    stage = "breaker",
                    endpoint = %self.endpoint,
                    "half-open probe failed, reopening"
                );
                core.transition(&self.endpoint, BreakerState::Open);
            }
            BreakerState::Closed if core.consecutive_failures >= self.config.failure_threshold => {
                core.transition(&self.endpoint, BreakerState::Open);
            }
            _ => {}
        }
    }

    /// Returns the current state. Primarily useful for diagnostics and tests.
    pub fn state(&self) -> BreakerState {
        self.core.lock().expect("breaker state poisoned").state
    }

    /// Endpoint key this breaker guards.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Registry of circuit breakers keyed by logical endpoint.
///
/// Breakers are created lazily on first use and live for the registry's
/// lifetime. The registry is explicit, injectable state: tests instantiate
/// isolated registries instead of sharing a hidden global.
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    config: BreakerConfig,
    clock: Clock,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, crate::system_clock())
    }

    pub fn with_clock(config: BreakerConfig, clock: Clock) -> Self {
        Self {
            breakers: Arc::new(Mutex::new(HashMap::new())),
            config,
            clock,
        }
    }

    /// Returns the breaker for the endpoint key, creating it on first use.
    pub fn get_or_create(&self, endpoint: &str) -> CircuitBreaker {
        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| CircuitBreaker::new(endpoint, self.config, self.clock.clone()))
            .clone()
    }
}
