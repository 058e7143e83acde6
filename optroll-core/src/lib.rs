//! Fundamental data types shared across the entire workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod symbol;

pub use symbol::{OptionKind, OptionSymbol, SymbolError};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `BTCUSDT`).
pub type Symbol = String;

/// Unique identifier assigned to orders by the exchange.
pub type OrderId = String;
/// Stable integer identity of a watch task.
pub type TaskId = i64;

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Side {
    /// Buy the instrument.
    Buy,
    /// Sell the instrument.
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Exchange wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
        }
    }

    /// Parse the exchange wire representation.
    #[must_use]
    pub fn from_exchange(value: &str) -> Option<Self> {
        match value {
            "Buy" => Some(Self::Buy),
            "Sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderType {
    /// Execute immediately at best available price.
    Market,
    /// Execute at the provided limit price.
    Limit,
}

/// Optional time-in-force constraints.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TimeInForce {
    GoodTilCanceled,
    ImmediateOrCancel,
    FillOrKill,
}

/// Desired order placement parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub price: Option<Price>,
    pub reduce_only: bool,
    pub time_in_force: Option<TimeInForce>,
    pub client_order_id: String,
}

/// Snapshot of an exchange position.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: Option<Side>,
    pub quantity: Quantity,
    pub entry_price: Option<Price>,
    pub mark_price: Option<Price>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// A zero-quantity placeholder for symbols with no open position.
    #[must_use]
    pub fn flat(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            side: None,
            quantity: Decimal::ZERO,
            entry_price: None,
            mark_price: None,
            updated_at: Utc::now(),
        }
    }

    /// True when the exchange reports no remaining contracts.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// A single observation from the underlying index price feed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PriceEvent {
    pub symbol: Symbol,
    pub price: Price,
    pub observed_at: DateTime<Utc>,
}

/// Saga states persisted on the task row.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TaskState {
    Idle,
    RollInitiated,
    Leg1Closed,
    Completed,
    Failed,
}

impl TaskState {
    /// Database column representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::RollInitiated => "ROLL_INITIATED",
            Self::Leg1Closed => "LEG1_CLOSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the database column representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IDLE" => Some(Self::Idle),
            "ROLL_INITIATED" => Some(Self::RollInitiated),
            "LEG1_CLOSED" => Some(Self::Leg1Closed),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states leave active circulation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The central aggregate: one watched option position with its roll trigger.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub owner_id: i64,
    pub credential_id: i64,
    pub current_option_symbol: Symbol,
    pub underlying_symbol: Symbol,
    pub target_side: Option<Side>,
    pub current_qty: Quantity,
    pub trigger_price: Price,
    pub next_strike_step: Decimal,
    pub status: TaskState,
    pub version: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Suffix check mirrors the exchange symbol convention; cheap enough for
    /// the dispatch hot path.
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.current_option_symbol.ends_with("-C")
    }

    /// Whether the observed underlying price crosses the trigger.
    ///
    /// Calls roll when the price rises to the trigger, puts when it falls.
    /// Only `IDLE` tasks are eligible; everything else is either mid-saga or
    /// terminal.
    #[must_use]
    pub fn should_roll(&self, price: Price) -> bool {
        if self.status != TaskState::Idle {
            return false;
        }
        if self.is_call() {
            price >= self.trigger_price
        } else {
            price <= self.trigger_price
        }
    }

    /// Parse the held instrument into its structured form.
    pub fn option_symbol(&self) -> Result<OptionSymbol, SymbolError> {
        self.current_option_symbol.parse()
    }
}

/// Idempotency key for the closing leg of a roll attempt.
#[must_use]
pub fn close_order_link_id(task_id: TaskId, version: i64) -> String {
    format!("close-{task_id}-v{version}")
}

/// Idempotency key for the opening leg of a roll attempt.
#[must_use]
pub fn open_order_link_id(task_id: TaskId, version: i64) -> String {
    format!("open-{task_id}-v{version}")
}

/// Immutable unit of work handed from the dispatcher to the worker pool.
#[derive(Clone, Debug)]
pub struct Job {
    pub task: Task,
    pub observed_price: Price,
}

impl Job {
    #[must_use]
    pub fn new(task: Task, observed_price: Price) -> Self {
        Self {
            task,
            observed_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_task(symbol: &str, trigger: Decimal) -> Task {
        Task {
            id: 7,
            owner_id: 1,
            credential_id: 1,
            current_option_symbol: symbol.to_string(),
            underlying_symbol: "BTCUSDT".to_string(),
            target_side: Some(Side::Sell),
            current_qty: dec!(0.1),
            trigger_price: trigger,
            next_strike_step: dec!(1000),
            status: TaskState::Idle,
            version: 1,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn call_rolls_when_price_reaches_trigger() {
        let task = sample_task("BTC-26DEC25-100000-C", dec!(100000));
        assert!(!task.should_roll(dec!(99999.99)));
        assert!(task.should_roll(dec!(100000)));
        assert!(task.should_roll(dec!(100500)));
    }

    #[test]
    fn put_rolls_when_price_falls_to_trigger() {
        let task = sample_task("ETH-30JAN26-3000-P", dec!(3000));
        assert!(!task.should_roll(dec!(3000.01)));
        assert!(task.should_roll(dec!(3000)));
        assert!(task.should_roll(dec!(2990)));
    }

    #[test]
    fn non_idle_tasks_never_roll() {
        let mut task = sample_task("BTC-26DEC25-100000-C", dec!(100000));
        task.status = TaskState::Leg1Closed;
        assert!(!task.should_roll(dec!(200000)));
    }

    #[test]
    fn order_link_ids_are_versioned() {
        assert_eq!(close_order_link_id(42, 2), "close-42-v2");
        assert_eq!(open_order_link_id(42, 4), "open-42-v4");
    }

    #[test]
    fn task_state_round_trips_through_column_form() {
        for state in [
            TaskState::Idle,
            TaskState::RollInitiated,
            TaskState::Leg1Closed,
            TaskState::Completed,
            TaskState::Failed,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("LEG2_OPENING"), None);
    }
}
