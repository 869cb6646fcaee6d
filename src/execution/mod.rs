// Order execution, trade management and market data collection
pub mod executor;
pub mod order_submitter;
pub mod paper;
pub mod price_feed;
pub mod strategy_loop;
pub mod tick_store;
pub mod trade_manager;

pub use executor::{ExecutionAction, ExecutionDecision, Executor};
pub use order_submitter::{OrderGateway, OrderSubmitter};
pub use paper::PaperGateway;
pub use price_feed::PriceFeedManager;
pub use strategy_loop::{LoopOutcome, LoopSettings, LoopStatus, PendingEntry, SessionStats, StrategyLoop};
pub use tick_store::TickStore;
pub use trade_manager::{
    ClosedTrade, ExitOrder, ExitReason, ExitRules, ExitSignal, Trade, TradeDecision, TradeManager,
};
