use crate::models::Direction;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Limits that gate new entries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakers {
    pub max_trades_per_direction: u32,
    pub max_consecutive_failures: u32,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self {
            max_trades_per_direction: 3, // per trading day, CE and PE counted separately
            max_consecutive_failures: 5, // failed broker calls or rejections with no fill between
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradingState {
    pub ce_trades: u32,
    pub pe_trades: u32,
    pub consecutive_failures: u32,
    /// Set once the failure breaker trips; entries stay halted for the session
    pub halted: bool,
    pub trading_day: NaiveDate,
}

impl TradingState {
    pub fn new(trading_day: NaiveDate) -> Self {
        Self {
            ce_trades: 0,
            pe_trades: 0,
            consecutive_failures: 0,
            halted: false,
            trading_day,
        }
    }

    pub fn trades(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Ce => self.ce_trades,
            Direction::Pe => self.pe_trades,
        }
    }

    /// Reset the daily counters when the trading day changes.
    /// Returns true if a reset happened.
    pub fn roll_day(&mut self, today: NaiveDate) -> bool {
        if today == self.trading_day {
            return false;
        }

        self.ce_trades = 0;
        self.pe_trades = 0;
        self.trading_day = today;
        true
    }

    /// A confirmed fill. Acknowledgements and status polls do not count.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerTrip {
    DailyTradeLimit(Direction),
    ConsecutiveFailures,
}

impl CircuitBreakers {
    /// May a new entry in `direction` be attempted?
    pub fn check(&self, state: &TradingState, direction: Direction) -> Result<(), CircuitBreakerTrip> {
        if state.halted {
            return Err(CircuitBreakerTrip::ConsecutiveFailures);
        }

        if state.trades(direction) >= self.max_trades_per_direction {
            return Err(CircuitBreakerTrip::DailyTradeLimit(direction));
        }

        Ok(())
    }

    /// Count an accepted entry. Refuses once the direction is at its limit,
    /// so the counter can never exceed `max_trades_per_direction`.
    pub fn record_entry(
        &self,
        state: &mut TradingState,
        direction: Direction,
    ) -> Result<u32, CircuitBreakerTrip> {
        if state.trades(direction) >= self.max_trades_per_direction {
            return Err(CircuitBreakerTrip::DailyTradeLimit(direction));
        }

        let counter = match direction {
            Direction::Ce => &mut state.ce_trades,
            Direction::Pe => &mut state.pe_trades,
        };
        *counter += 1;
        Ok(*counter)
    }

    /// Give back a slot taken by an entry that never filled
    pub fn release_entry(&self, state: &mut TradingState, direction: Direction) {
        let counter = match direction {
            Direction::Ce => &mut state.ce_trades,
            Direction::Pe => &mut state.pe_trades,
        };
        *counter = counter.saturating_sub(1);
    }

    /// Count a failed broker call. Returns the trip the first time the limit
    /// is reached.
    pub fn record_failure(&self, state: &mut TradingState) -> Option<CircuitBreakerTrip> {
        state.consecutive_failures += 1;

        if !state.halted && state.consecutive_failures >= self.max_consecutive_failures {
            state.halted = true;
            return Some(CircuitBreakerTrip::ConsecutiveFailures);
        }

        None
    }

    /// Both directions have used their daily allowance
    pub fn exhausted(&self, state: &TradingState) -> bool {
        state.ce_trades >= self.max_trades_per_direction
            && state.pe_trades >= self.max_trades_per_direction
    }
}
