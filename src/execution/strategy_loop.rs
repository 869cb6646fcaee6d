use super::{
    ExecutionAction, Executor, ExitOrder, ExitRules, ExitSignal, OrderSubmitter, PriceFeedManager,
    TickStore, TradeManager,
};
use crate::config::{AppConfig, SessionPhase, TradingWindow};
use crate::models::{Direction, Instrument, OrderStatus};
use crate::risk::{CircuitBreakers, TradingState};
use crate::strategy::SignalEvaluator;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

/// An acknowledged entry order waiting for its fill
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub order_id: String,
    pub instrument: Instrument,
    pub direction: Direction,
    pub quantity: u32,
    pub limit_price: f64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    WindowClosed,
    LimitsExhausted,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Continue,
    Finished(LoopOutcome),
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub iterations: u64,
    pub signals: u64,
    pub entries_submitted: u64,
    pub entries_filled: u64,
    pub entries_dropped: u64,
    pub exits: u64,
    pub order_failures: u64,
}

/// Timing and exit parameters for the loop
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub window: TradingWindow,
    pub poll_interval: std::time::Duration,
    pub fill_timeout: Duration,
    pub square_off_on_close: bool,
    pub exit_rules: ExitRules,
    pub breakers: CircuitBreakers,
}

impl From<&AppConfig> for LoopSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            window: config.trading.window.clone(),
            poll_interval: config.poll_interval(),
            fill_timeout: Duration::seconds(config.trading.fill_timeout_secs),
            square_off_on_close: config.trading.square_off_on_close,
            exit_rules: ExitRules::from(&config.trading),
            breakers: config.risk.clone(),
        }
    }
}

/// The trading loop: reconcile fills, manage exits, look for entries
pub struct StrategyLoop {
    instruments: Vec<Instrument>,
    settings: LoopSettings,
    evaluator: SignalEvaluator,
    submitter: OrderSubmitter,
    executor: Executor,
    store: TickStore,
    price_feed: Option<PriceFeedManager>,
    trades: TradeManager,
    state: TradingState,
    pending: Vec<PendingEntry>,
    stats: SessionStats,
    announced_wait: bool,
}

impl StrategyLoop {
    pub fn new(
        instruments: Vec<Instrument>,
        settings: LoopSettings,
        evaluator: SignalEvaluator,
        submitter: OrderSubmitter,
        store: TickStore,
    ) -> Self {
        let state = TradingState::new(settings.window.local_date(Utc::now()));

        Self {
            instruments,
            executor: Executor::new(settings.breakers.clone()),
            trades: TradeManager::new(settings.exit_rules),
            settings,
            evaluator,
            submitter,
            store,
            price_feed: None,
            state,
            pending: Vec::new(),
            stats: SessionStats::default(),
            announced_wait: false,
        }
    }

    /// Use the REST quote fallback for instruments the stream has not priced
    pub fn with_price_feed(mut self, price_feed: PriceFeedManager) -> Self {
        self.price_feed = Some(price_feed);
        self
    }

    pub fn state(&self) -> &TradingState {
        &self.state
    }

    pub fn trades(&self) -> &TradeManager {
        &self.trades
    }

    pub fn pending_entries(&self) -> &[PendingEntry] {
        &self.pending
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    fn breakers(&self) -> &CircuitBreakers {
        self.executor.breakers()
    }

    fn idle(&self) -> bool {
        self.pending.is_empty() && self.trades.open_trades().is_empty()
    }

    /// One pass of the loop at `now`
    pub async fn iterate(&mut self, now: DateTime<Utc>) -> anyhow::Result<LoopStatus> {
        match self.settings.window.phase(now) {
            SessionPhase::WaitingForWindow => {
                if !self.announced_wait {
                    tracing::info!(
                        "⏳ Waiting for trading window {} - {}",
                        self.settings.window.start.format("%H:%M"),
                        self.settings.window.end.format("%H:%M")
                    );
                    self.announced_wait = true;
                }
                return Ok(LoopStatus::Continue);
            }
            SessionPhase::Closed => {
                self.close_session(now).await;
                return Ok(LoopStatus::Finished(LoopOutcome::WindowClosed));
            }
            SessionPhase::Active => {}
        }

        self.stats.iterations += 1;

        let today = self.settings.window.local_date(now);
        if self.state.roll_day(today) {
            tracing::info!("📅 New trading day {}, daily counters reset", today);
        }

        self.reconcile_pending(now).await;
        self.manage_exits(now).await;
        self.scan_entries(now).await;

        if self.idle() {
            if self.state.halted {
                anyhow::bail!(
                    "Circuit breaker tripped after {} consecutive failures",
                    self.state.consecutive_failures
                );
            }
            if self.breakers().exhausted(&self.state) {
                tracing::info!("🏁 Daily trade limits reached for both directions");
                return Ok(LoopStatus::Finished(LoopOutcome::LimitsExhausted));
            }
        }

        Ok(LoopStatus::Continue)
    }

    /// Iterate every poll interval until the session ends
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<LoopOutcome> {
        tracing::info!(
            "▶️  Strategy loop started: {} instruments, policy {}",
            self.instruments.len(),
            self.evaluator.policy_name()
        );

        loop {
            let now = Utc::now();
            let status = self.iterate(now).await;

            match status {
                Ok(LoopStatus::Continue) => {}
                Ok(LoopStatus::Finished(outcome)) => {
                    self.log_summary(outcome);
                    return Ok(outcome);
                }
                Err(e) => {
                    tracing::error!("🛑 {}", e);
                    self.log_summary(LoopOutcome::Shutdown);
                    return Err(e);
                }
            }

            let wait = match self.settings.window.phase(now) {
                SessionPhase::WaitingForWindow => self
                    .settings
                    .window
                    .until_start(now)
                    .to_std()
                    .unwrap_or(self.settings.poll_interval)
                    .clamp(std::time::Duration::from_secs(1), self.settings.poll_interval),
                _ => self.settings.poll_interval,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown received, stopping strategy loop");
                    if !self.idle() {
                        tracing::warn!(
                            "⚠️  Stopping with {} open trades and {} pending entries",
                            self.trades.open_trades().len(),
                            self.pending.len()
                        );
                    }
                    self.log_summary(LoopOutcome::Shutdown);
                    return Ok(LoopOutcome::Shutdown);
                }
            }
        }
    }

    fn record_failure(&mut self) {
        self.stats.order_failures += 1;
        let breakers = self.executor.breakers().clone();
        if let Some(trip) = breakers.record_failure(&mut self.state) {
            tracing::error!(
                "🚨 Circuit breaker tripped ({:?}) after {} consecutive failures, no new entries this session",
                trip,
                self.state.consecutive_failures
            );
        }
    }

    async fn current_prices(&self, instruments: &[Instrument], now: DateTime<Utc>) -> HashMap<String, f64> {
        match &self.price_feed {
            Some(feed) => feed.latest_prices(instruments, now).await,
            None => self.store.latest_prices().unwrap_or_else(|e| {
                tracing::error!("Failed to read tick store: {}", e);
                HashMap::new()
            }),
        }
    }

    /// Poll pending entries: filled ones become trades, dead ones are dropped
    async fn reconcile_pending(&mut self, now: DateTime<Utc>) {
        let pending = std::mem::take(&mut self.pending);
        let breakers = self.breakers().clone();

        for entry in pending {
            let update = match self.submitter.status(&entry.order_id).await {
                Ok(update) => update,
                Err(e) => {
                    tracing::warn!("Status poll failed for order {}: {}", entry.order_id, e);
                    self.record_failure();
                    self.pending.push(entry);
                    continue;
                }
            };

            match update.status {
                OrderStatus::Traded => {
                    self.state.record_success();
                    let fill_price = update.average_price.unwrap_or(entry.limit_price);
                    self.open_filled(&entry, fill_price, now);
                }
                status if status.is_terminal_failure() => {
                    tracing::warn!(
                        "⚠️  Entry order {} on {} ended {:?}: {}",
                        entry.order_id,
                        entry.instrument.security_id,
                        status,
                        update.message.as_deref().unwrap_or("no reason given")
                    );
                    breakers.release_entry(&mut self.state, entry.direction);
                    self.stats.entries_dropped += 1;
                    if status == OrderStatus::Rejected {
                        self.record_failure();
                    }
                }
                _ if now - entry.submitted_at >= self.settings.fill_timeout => {
                    self.cancel_stale(entry, now).await;
                }
                _ => self.pending.push(entry),
            }
        }
    }

    async fn cancel_stale(&mut self, entry: PendingEntry, now: DateTime<Utc>) {
        tracing::warn!(
            "⌛ Entry order {} unfilled after {}s, cancelling",
            entry.order_id,
            self.settings.fill_timeout.num_seconds()
        );

        match self.submitter.cancel(&entry.order_id).await {
            Ok(OrderStatus::Traded) => {
                // Filled while we were deciding to cancel
                self.state.record_success();
                let price = entry.limit_price;
                self.open_filled(&entry, price, now);
            }
            Ok(_) => {
                let breakers = self.breakers().clone();
                breakers.release_entry(&mut self.state, entry.direction);
                self.stats.entries_dropped += 1;
            }
            Err(e) => {
                tracing::warn!("Cancel failed for order {}: {}", entry.order_id, e);
                self.record_failure();
                self.pending.push(entry);
            }
        }
    }

    fn open_filled(&mut self, entry: &PendingEntry, fill_price: f64, now: DateTime<Utc>) {
        match self.trades.open_trade_at(
            entry.instrument.clone(),
            entry.direction,
            fill_price,
            entry.quantity,
            entry.order_id.clone(),
            Some(now),
        ) {
            Ok(_) => self.stats.entries_filled += 1,
            Err(e) => tracing::error!("Could not open trade for order {}: {}", entry.order_id, e),
        }
    }

    /// Exit orders for trades that hit their target or stop
    async fn manage_exits(&mut self, now: DateTime<Utc>) {
        if self.trades.open_trades().is_empty() {
            return;
        }

        self.reconcile_exits(now).await;

        let instruments: Vec<Instrument> = self
            .trades
            .open_trades()
            .iter()
            .map(|t| t.instrument.clone())
            .collect();
        let prices = self.current_prices(&instruments, now).await;
        let exits = self.trades.check_exits(&prices);

        self.submit_exits(exits, now).await;
    }

    /// Poll working exit orders. A trade closes only on a confirmed fill;
    /// dead or stale exit orders are dropped so the exit is issued again.
    async fn reconcile_exits(&mut self, now: DateTime<Utc>) {
        for (trade_id, order) in self.trades.working_exits() {
            let update = match self.submitter.status(&order.order_id).await {
                Ok(update) => update,
                Err(e) => {
                    tracing::warn!("Status poll failed for exit order {}: {}", order.order_id, e);
                    self.record_failure();
                    continue;
                }
            };

            match update.status {
                OrderStatus::Traded => {
                    let price = update.average_price.unwrap_or(order.price);
                    self.close_filled(trade_id, &order, price, now);
                }
                status if status.is_terminal_failure() => {
                    tracing::warn!(
                        "⚠️  Exit order {} ended {:?}: {}, re-issuing",
                        order.order_id,
                        status,
                        update.message.as_deref().unwrap_or("no reason given")
                    );
                    self.trades.clear_exit_order(trade_id);
                    if status == OrderStatus::Rejected {
                        self.record_failure();
                    }
                }
                _ if now - order.submitted_at >= self.settings.fill_timeout => {
                    tracing::warn!(
                        "⌛ Exit order {} unfilled after {}s, cancelling",
                        order.order_id,
                        self.settings.fill_timeout.num_seconds()
                    );
                    match self.submitter.cancel(&order.order_id).await {
                        Ok(OrderStatus::Traded) => {
                            self.close_filled(trade_id, &order, order.price, now);
                        }
                        Ok(_) => {
                            self.trades.clear_exit_order(trade_id);
                        }
                        Err(e) => {
                            tracing::warn!("Cancel failed for exit order {}: {}", order.order_id, e);
                            self.record_failure();
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn close_filled(&mut self, trade_id: Uuid, order: &ExitOrder, price: f64, now: DateTime<Utc>) {
        self.state.record_success();
        match self.trades.close_trade_at(trade_id, price, order.reason, Some(now)) {
            Ok(_) => self.stats.exits += 1,
            Err(e) => tracing::error!("Could not close trade {}: {}", trade_id, e),
        }
    }

    async fn submit_exits(&mut self, exits: Vec<ExitSignal>, now: DateTime<Utc>) {
        for exit in exits {
            let side = exit.direction.exit_side();
            match self
                .submitter
                .submit(&exit.instrument, exit.quantity, exit.price, side)
                .await
            {
                Ok(ack) => {
                    let order = ExitOrder {
                        order_id: ack.order_id,
                        reason: exit.reason,
                        price: exit.price,
                        submitted_at: now,
                    };
                    if ack.status == OrderStatus::Traded {
                        self.close_filled(exit.trade_id, &order, exit.price, now);
                    } else if let Err(e) = self.trades.record_exit_order(exit.trade_id, order) {
                        tracing::error!("Could not track exit for trade {}: {}", exit.trade_id, e);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Exit order for {} failed, will retry: {}",
                        exit.instrument.security_id,
                        e
                    );
                    self.record_failure();
                }
            }
        }
    }

    /// Evaluate idle instruments and submit entries on signals
    async fn scan_entries(&mut self, now: DateTime<Utc>) {
        if self.state.halted {
            return;
        }

        let instruments = self.instruments.clone();
        let prices = self.current_prices(&instruments, now).await;

        for instrument in &instruments {
            if self.state.halted {
                break;
            }

            let busy = self.trades.has_open_trade(&instrument.security_id)
                || self
                    .pending
                    .iter()
                    .any(|p| p.instrument.security_id == instrument.security_id);
            if busy {
                continue;
            }

            let signal = self.evaluator.evaluate_at(&instrument.security_id, now);
            if signal.fired() {
                self.stats.signals += 1;
            }

            let decision = self.executor.process_signal(
                &signal,
                instrument,
                prices.get(&instrument.security_id).copied(),
                &self.state,
                busy,
            );

            let ExecutionAction::Enter {
                direction,
                side,
                quantity,
                price,
            } = decision.action
            else {
                if signal.fired() {
                    tracing::info!(
                        "Skipping {} on {}: {}",
                        signal.direction.map(|d| d.to_string()).unwrap_or_default(),
                        instrument.security_id,
                        decision.reason
                    );
                }
                continue;
            };

            tracing::info!("🎯 {} on {}: {}", direction, instrument.security_id, decision.reason);

            match self.submitter.submit(instrument, quantity, price, side).await {
                Ok(ack) => {
                    self.stats.entries_submitted += 1;

                    let breakers = self.breakers().clone();
                    match breakers.record_entry(&mut self.state, direction) {
                        Ok(count) => tracing::info!(
                            "{} entries today: {}/{}",
                            direction,
                            count,
                            breakers.max_trades_per_direction
                        ),
                        Err(trip) => tracing::error!("Entry counted past limit: {:?}", trip),
                    }

                    self.pending.push(PendingEntry {
                        order_id: ack.order_id,
                        instrument: instrument.clone(),
                        direction,
                        quantity,
                        limit_price: self.submitter.limit_price(price, side),
                        submitted_at: now,
                    });
                }
                Err(_) => self.record_failure(),
            }
        }
    }

    /// Window closed: square off open trades and drop unfilled entries
    async fn close_session(&mut self, now: DateTime<Utc>) {
        tracing::info!("🔔 Trading window closed");

        for entry in std::mem::take(&mut self.pending) {
            match self.submitter.cancel(&entry.order_id).await {
                Ok(OrderStatus::Traded) => {
                    let price = entry.limit_price;
                    self.open_filled(&entry, price, now);
                }
                Ok(_) => self.stats.entries_dropped += 1,
                Err(e) => tracing::warn!("Cancel failed for order {}: {}", entry.order_id, e),
            }
        }

        if !self.settings.square_off_on_close || self.trades.open_trades().is_empty() {
            return;
        }

        self.reconcile_exits(now).await;

        let instruments: Vec<Instrument> = self
            .trades
            .open_trades()
            .iter()
            .map(|t| t.instrument.clone())
            .collect();
        let prices = self.current_prices(&instruments, now).await;
        let exits = self.trades.square_off(&prices);
        self.submit_exits(exits, now).await;

        if !self.trades.open_trades().is_empty() {
            tracing::error!(
                "❌ {} trades still open after square-off ({} exit orders working), check them manually",
                self.trades.open_trades().len(),
                self.trades.working_exits().len()
            );
        }
    }

    fn log_summary(&self, outcome: LoopOutcome) {
        let stats = &self.stats;
        tracing::info!("📊 Session summary ({:?})", outcome);
        tracing::info!(
            "   Iterations: {}, signals: {}, entries submitted: {}, filled: {}, dropped: {}",
            stats.iterations,
            stats.signals,
            stats.entries_submitted,
            stats.entries_filled,
            stats.entries_dropped
        );
        tracing::info!(
            "   CE trades: {}, PE trades: {}, exits: {}, order failures: {}",
            self.state.ce_trades,
            self.state.pe_trades,
            stats.exits,
            stats.order_failures
        );
        tracing::info!(
            "   Closed trades: {}, open trades: {}, realised P&L: {:+.2}",
            self.trades.closed_trades().len(),
            self.trades.open_trades().len(),
            self.trades.total_pnl()
        );
    }
}
