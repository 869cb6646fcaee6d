use crate::config::TradingConfig;
use crate::models::{Direction, Instrument};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Target,
    StopLoss,
    TrailingStop,
    SessionEnd,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::Target => "target",
            ExitReason::StopLoss => "stop-loss",
            ExitReason::TrailingStop => "trailing-stop",
            ExitReason::SessionEnd => "session-end",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TradeDecision {
    Exit(ExitReason),
    Hold { trailing_active: bool },
}

/// Point-based exit thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitRules {
    pub target_points: f64,
    pub stop_loss_points: f64,
    pub trailing_step: f64,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            target_points: 25.0,
            stop_loss_points: 50.0,
            trailing_step: 5.0,
        }
    }
}

impl ExitRules {
    /// Exit check first, then ratchet the trailing stop if the trade holds.
    ///
    /// The stop only moves in whole steps as the favourable move clears
    /// `trail_anchor + trailing_step`, so it never loosens.
    pub fn evaluate(&self, trade: &mut Trade, current_price: f64) -> TradeDecision {
        let current_move = trade.current_move(current_price);

        if current_move >= self.target_points {
            return TradeDecision::Exit(ExitReason::Target);
        }

        if current_move <= trade.stop_move {
            return TradeDecision::Exit(if trade.trailing_active() {
                ExitReason::TrailingStop
            } else {
                ExitReason::StopLoss
            });
        }

        if self.trailing_step > 0.0 {
            while current_move >= trade.trail_anchor + self.trailing_step {
                trade.trail_anchor += self.trailing_step;
                trade.stop_move += self.trailing_step;
            }
        }

        TradeDecision::Hold {
            trailing_active: trade.trailing_active(),
        }
    }
}

impl From<&TradingConfig> for ExitRules {
    fn from(config: &TradingConfig) -> Self {
        Self {
            target_points: config.target_points,
            stop_loss_points: config.stop_loss_points,
            trailing_step: config.trailing_step,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub id: Uuid,
    pub instrument: Instrument,
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: u32,
    pub entry_order_id: String,
    pub entry_time: DateTime<Utc>,
    /// Favourable move (points) at or below which the trade is stopped out.
    /// Starts at -stop_loss_points and only ever rises.
    pub stop_move: f64,
    /// Move level the last ratchet happened at
    pub trail_anchor: f64,
    /// Set once an exit was decided; kept until the trade closes
    pub pending_exit: Option<ExitReason>,
    /// Exit order working at the broker. The trade stays open until it fills.
    pub exit_order: Option<ExitOrder>,
}

impl Trade {
    pub fn trailing_active(&self) -> bool {
        self.trail_anchor > 0.0
    }

    pub fn current_move(&self, current_price: f64) -> f64 {
        self.direction.directional_move(self.entry_price, current_price)
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        self.current_move(current_price) * self.quantity as f64
    }
}

#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub trade: Trade,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub reason: ExitReason,
    pub realized_pnl: f64,
}

/// An acknowledged exit order waiting for its fill
#[derive(Debug, Clone, PartialEq)]
pub struct ExitOrder {
    pub order_id: String,
    pub reason: ExitReason,
    /// Last price when the exit was decided
    pub price: f64,
    pub submitted_at: DateTime<Utc>,
}

/// An open trade that needs an exit order
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub trade_id: Uuid,
    pub instrument: Instrument,
    pub direction: Direction,
    pub quantity: u32,
    pub price: f64,
    pub reason: ExitReason,
}

pub struct TradeManager {
    rules: ExitRules,
    open: Vec<Trade>,
    closed: Vec<ClosedTrade>,
    total_pnl: f64,
}

impl TradeManager {
    pub fn new(rules: ExitRules) -> Self {
        Self {
            rules,
            open: Vec::new(),
            closed: Vec::new(),
            total_pnl: 0.0,
        }
    }

    pub fn rules(&self) -> &ExitRules {
        &self.rules
    }

    /// Register a filled entry
    pub fn open_trade(
        &mut self,
        instrument: Instrument,
        direction: Direction,
        entry_price: f64,
        quantity: u32,
        entry_order_id: String,
    ) -> anyhow::Result<Uuid> {
        self.open_trade_at(instrument, direction, entry_price, quantity, entry_order_id, None)
    }

    /// Register a filled entry with an explicit timestamp
    pub fn open_trade_at(
        &mut self,
        instrument: Instrument,
        direction: Direction,
        entry_price: f64,
        quantity: u32,
        entry_order_id: String,
        timestamp: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Uuid> {
        if !(entry_price.is_finite() && entry_price > 0.0) {
            anyhow::bail!("Invalid entry price {}", entry_price);
        }
        if quantity == 0 {
            anyhow::bail!("Quantity must be positive");
        }

        let id = Uuid::new_v4();
        tracing::info!(
            "📈 Opened {} trade on {} @ {:.2} x{} (order {})",
            direction,
            instrument.security_id,
            entry_price,
            quantity,
            entry_order_id
        );

        self.open.push(Trade {
            id,
            instrument,
            direction,
            entry_price,
            quantity,
            entry_order_id,
            entry_time: timestamp.unwrap_or_else(Utc::now),
            stop_move: -self.rules.stop_loss_points,
            trail_anchor: 0.0,
            pending_exit: None,
            exit_order: None,
        });

        Ok(id)
    }

    /// Decide whether a trade should exit at `current_price`
    pub fn evaluate(&self, trade: &mut Trade, current_price: f64) -> TradeDecision {
        self.rules.evaluate(trade, current_price)
    }

    /// Evaluate an open trade by id
    pub fn evaluate_trade(&mut self, trade_id: Uuid, current_price: f64) -> anyhow::Result<TradeDecision> {
        let index = self.index_of(trade_id)?;
        let rules = self.rules;
        Ok(rules.evaluate(&mut self.open[index], current_price))
    }

    /// Evaluate every open trade that has a price. Trades already marked for
    /// exit are returned again so a failed exit order gets retried; trades
    /// with an exit order still working are left alone.
    pub fn check_exits(&mut self, prices: &HashMap<String, f64>) -> Vec<ExitSignal> {
        let mut exits = Vec::new();
        let rules = self.rules;

        for trade in self.open.iter_mut() {
            if trade.exit_order.is_some() {
                continue;
            }

            let Some(&price) = prices.get(&trade.instrument.security_id) else {
                tracing::warn!(
                    "No price for {} ({} trade), holding",
                    trade.instrument.security_id,
                    trade.direction
                );
                continue;
            };

            let reason = match trade.pending_exit {
                Some(reason) => reason,
                None => match rules.evaluate(trade, price) {
                    TradeDecision::Exit(reason) => {
                        tracing::info!(
                            "🚪 {} trade on {} hit {} at {:.2} (move {:+.2})",
                            trade.direction,
                            trade.instrument.security_id,
                            reason,
                            price,
                            trade.current_move(price)
                        );
                        trade.pending_exit = Some(reason);
                        reason
                    }
                    TradeDecision::Hold { trailing_active } => {
                        tracing::debug!(
                            "Holding {} on {} at {:.2}, stop move {:+.2}, trailing {}",
                            trade.direction,
                            trade.instrument.security_id,
                            price,
                            trade.stop_move,
                            trailing_active
                        );
                        continue;
                    }
                },
            };

            exits.push(ExitSignal {
                trade_id: trade.id,
                instrument: trade.instrument.clone(),
                direction: trade.direction,
                quantity: trade.quantity,
                price,
                reason,
            });
        }

        exits
    }

    /// Mark every open trade for exit at session end
    pub fn square_off(&mut self, prices: &HashMap<String, f64>) -> Vec<ExitSignal> {
        for trade in self.open.iter_mut() {
            if trade.pending_exit.is_none() {
                trade.pending_exit = Some(ExitReason::SessionEnd);
            }
        }
        self.check_exits(prices)
    }

    /// Remember the exit order working for a trade
    pub fn record_exit_order(&mut self, trade_id: Uuid, order: ExitOrder) -> anyhow::Result<()> {
        let index = self.index_of(trade_id)?;
        self.open[index].exit_order = Some(order);
        Ok(())
    }

    /// Forget a dead exit order so the next check re-issues the exit
    pub fn clear_exit_order(&mut self, trade_id: Uuid) -> Option<ExitOrder> {
        self.open
            .iter_mut()
            .find(|t| t.id == trade_id)
            .and_then(|t| t.exit_order.take())
    }

    /// Open trades with an exit order working
    pub fn working_exits(&self) -> Vec<(Uuid, ExitOrder)> {
        self.open
            .iter()
            .filter_map(|t| t.exit_order.clone().map(|order| (t.id, order)))
            .collect()
    }

    /// Close a trade once its exit order has filled
    pub fn close_trade(
        &mut self,
        trade_id: Uuid,
        exit_price: f64,
        reason: ExitReason,
    ) -> anyhow::Result<ClosedTrade> {
        self.close_trade_at(trade_id, exit_price, reason, None)
    }

    pub fn close_trade_at(
        &mut self,
        trade_id: Uuid,
        exit_price: f64,
        reason: ExitReason,
        timestamp: Option<DateTime<Utc>>,
    ) -> anyhow::Result<ClosedTrade> {
        let index = self.index_of(trade_id)?;
        let trade = self.open.remove(index);
        let realized_pnl = trade.unrealized_pnl(exit_price);

        tracing::info!(
            "📉 Closed {} trade on {} @ {:.2} ({}), P&L {:+.2}",
            trade.direction,
            trade.instrument.security_id,
            exit_price,
            reason,
            realized_pnl
        );

        let closed = ClosedTrade {
            trade,
            exit_price,
            exit_time: timestamp.unwrap_or_else(Utc::now),
            reason,
            realized_pnl,
        };
        self.total_pnl += realized_pnl;
        self.closed.push(closed.clone());

        Ok(closed)
    }

    fn index_of(&self, trade_id: Uuid) -> anyhow::Result<usize> {
        self.open
            .iter()
            .position(|t| t.id == trade_id)
            .ok_or_else(|| anyhow::anyhow!("Trade {} not open", trade_id))
    }

    pub fn get(&self, trade_id: Uuid) -> Option<&Trade> {
        self.open.iter().find(|t| t.id == trade_id)
    }

    pub fn has_open_trade(&self, security_id: &str) -> bool {
        self.open.iter().any(|t| t.instrument.security_id == security_id)
    }

    pub fn open_trades(&self) -> &[Trade] {
        &self.open
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn total_pnl(&self) -> f64 {
        self.total_pnl
    }
}
