use crate::models::{Direction, Instrument, Side, SignalDecision};
use crate::risk::{CircuitBreakers, TradingState};

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Enter {
        direction: Direction,
        side: Side,
        quantity: u32,
        price: f64,
    },
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }
}

/// Turns signals into entry decisions under the circuit breakers
pub struct Executor {
    breakers: CircuitBreakers,
}

impl Executor {
    pub fn new(breakers: CircuitBreakers) -> Self {
        Self { breakers }
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Decide whether a signal becomes an entry order
    ///
    /// # Arguments
    /// * `busy` - The instrument already has an open trade or a pending entry
    pub fn process_signal(
        &self,
        signal: &SignalDecision,
        instrument: &Instrument,
        current_price: Option<f64>,
        state: &TradingState,
        busy: bool,
    ) -> ExecutionDecision {
        let Some(direction) = signal.direction else {
            return ExecutionDecision::skip(signal.reason.clone());
        };

        // Check 1: one trade per instrument at a time
        if busy {
            return ExecutionDecision::skip(format!(
                "Already have open trade or pending order on {}",
                instrument.security_id
            ));
        }

        // Check 2: circuit breakers (daily counter for this direction, failure halt)
        if let Err(trip) = self.breakers.check(state, direction) {
            return ExecutionDecision::skip(format!("Circuit breaker: {:?}", trip));
        }

        // Check 3: something to price the order off
        let price = match current_price {
            Some(p) if p.is_finite() && p > 0.0 => p,
            _ => {
                return ExecutionDecision::skip(format!(
                    "No price for {}",
                    instrument.security_id
                ))
            }
        };

        ExecutionDecision {
            action: ExecutionAction::Enter {
                direction,
                side: direction.entry_side(),
                quantity: instrument.quantity,
                price,
            },
            reason: format!("{} signal: {}", direction, signal.reason),
        }
    }
}
