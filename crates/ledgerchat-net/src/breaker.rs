//! Connection health state machine.
//!
//! `Healthy -> Degraded -> CircuitOpen -> Resetting -> Healthy`.
//!
//! Soft failures (transport errors that are not a tripped guard) move a
//! healthy connection to `Degraded`; reaching the threshold opens the
//! circuit. A transient fault opens it immediately. Only an explicit reset
//! closes it again.

use std::sync::Mutex;

use ledgerchat_shared::types::ConnectionState;
use tracing::{info, warn};

use crate::ledger::LedgerError;

#[derive(Debug)]
struct BreakerState {
    state: ConnectionState,
    soft_failures: u32,
    last_error: Option<String>,
}

/// A state transition, returned so the owner can publish it.
pub type Transition = (ConnectionState, ConnectionState);

#[derive(Debug)]
pub struct CircuitBreaker {
    soft_failure_threshold: u32,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(soft_failure_threshold: u32) -> Self {
        Self {
            soft_failure_threshold: soft_failure_threshold.max(1),
            inner: Mutex::new(BreakerState {
                state: ConnectionState::Healthy,
                soft_failures: 0,
                last_error: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Fail fast while the circuit is open or a reset is in flight.
    pub fn guard(&self) -> Result<(), LedgerError> {
        match self.lock().state {
            ConnectionState::CircuitOpen | ConnectionState::Resetting => {
                Err(LedgerError::circuit_open())
            }
            ConnectionState::Healthy | ConnectionState::Degraded => Ok(()),
        }
    }

    pub fn record_success(&self) -> Option<Transition> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Degraded => {
                inner.soft_failures = 0;
                inner.state = ConnectionState::Healthy;
                Some((ConnectionState::Degraded, ConnectionState::Healthy))
            }
            ConnectionState::Healthy => {
                inner.soft_failures = 0;
                None
            }
            // A late success from a call issued before the trip does not close the circuit.
            ConnectionState::CircuitOpen | ConnectionState::Resetting => None,
        }
    }

    pub fn record_soft_failure(&self, error: &str) -> Option<Transition> {
        let mut inner = self.lock();
        inner.last_error = Some(error.to_string());

        let from = inner.state;
        match from {
            ConnectionState::Healthy | ConnectionState::Degraded => {
                inner.soft_failures += 1;
                if inner.soft_failures >= self.soft_failure_threshold {
                    inner.state = ConnectionState::CircuitOpen;
                    warn!(
                        failures = inner.soft_failures,
                        error, "soft failure threshold reached, opening circuit"
                    );
                } else {
                    inner.state = ConnectionState::Degraded;
                }
            }
            ConnectionState::CircuitOpen | ConnectionState::Resetting => {}
        }

        (from != inner.state).then_some((from, inner.state))
    }

    pub fn trip(&self, error: &str) -> Option<Transition> {
        let mut inner = self.lock();
        inner.last_error = Some(error.to_string());

        let from = inner.state;
        if from == ConnectionState::CircuitOpen {
            return None;
        }
        inner.state = ConnectionState::CircuitOpen;
        warn!(from = %from, error, "transient fault, circuit open");
        Some((from, ConnectionState::CircuitOpen))
    }

    pub fn begin_reset(&self) -> Transition {
        let mut inner = self.lock();
        let from = inner.state;
        inner.state = ConnectionState::Resetting;
        (from, ConnectionState::Resetting)
    }

    pub fn finish_reset(&self, reconnected: bool) -> Transition {
        let mut inner = self.lock();
        inner.soft_failures = 0;
        inner.state = if reconnected {
            inner.last_error = None;
            info!("connection reset, circuit closed");
            ConnectionState::Healthy
        } else {
            ConnectionState::CircuitOpen
        };
        (ConnectionState::Resetting, inner.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_failures_degrade_then_open() {
        let breaker = CircuitBreaker::new(3);

        assert_eq!(
            breaker.record_soft_failure("timeout"),
            Some((ConnectionState::Healthy, ConnectionState::Degraded))
        );
        assert!(breaker.guard().is_ok());
        assert_eq!(breaker.record_soft_failure("timeout"), None);
        assert_eq!(
            breaker.record_soft_failure("timeout"),
            Some((ConnectionState::Degraded, ConnectionState::CircuitOpen))
        );
        assert!(breaker.guard().unwrap_err().is_transient());
    }

    #[test]
    fn success_heals_degraded() {
        let breaker = CircuitBreaker::new(3);
        breaker.record_soft_failure("slow");
        breaker.record_success();
        assert_eq!(breaker.state(), ConnectionState::Healthy);

        // Counter was reset: two more soft failures do not open the circuit.
        breaker.record_soft_failure("slow");
        breaker.record_soft_failure("slow");
        assert_eq!(breaker.state(), ConnectionState::Degraded);
    }

    #[test]
    fn trip_opens_immediately_and_only_reset_closes() {
        let breaker = CircuitBreaker::new(3);
        breaker.trip("circuit breaker is open");
        assert_eq!(breaker.state(), ConnectionState::CircuitOpen);

        assert_eq!(breaker.record_success(), None);
        assert_eq!(breaker.state(), ConnectionState::CircuitOpen);

        breaker.begin_reset();
        assert!(breaker.guard().is_err());
        breaker.finish_reset(true);
        assert_eq!(breaker.state(), ConnectionState::Healthy);
        assert!(breaker.last_error().is_none());
    }

    #[test]
    fn failed_reset_stays_open() {
        let breaker = CircuitBreaker::new(3);
        breaker.trip("boom");
        breaker.begin_reset();
        assert_eq!(
            breaker.finish_reset(false),
            (ConnectionState::Resetting, ConnectionState::CircuitOpen)
        );
    }
}
