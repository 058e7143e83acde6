//! The per-task roll state machine.
//!
//! `IDLE -> ROLL_INITIATED -> LEG1_CLOSED -> IDLE (new symbol)`, with
//! `COMPLETED` for vanished or expired positions and `FAILED` only for fatal
//! errors before the close leg lands. Once the close leg is committed the
//! account is naked, so the opening leg retries until it succeeds or the
//! process is told to stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use optroll_broker::{Credentials, ExchangeError, ExchangePort};
use optroll_core::{
    close_order_link_id, open_order_link_id, OptionKind, OptionSymbol, OrderRequest, OrderType,
    Price, Side, Task, TaskState, TimeInForce,
};
use optroll_store::{StoreError, TaskStore};

use crate::observer::EngineObserver;
use crate::shutdown::ShutdownSignal;

/// Tuning knobs for the saga.
#[derive(Clone, Debug)]
pub struct SagaConfig {
    /// How far past settlement a contract may be before the task completes.
    pub expiry_grace: chrono::Duration,
    /// Cushion applied past the mark on the taking side (0.20 = 20%).
    pub aggressive_limit_slippage: Decimal,
    /// Pause between opening-leg attempts.
    pub leg2_retry_delay: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            expiry_grace: chrono::Duration::minutes(5),
            aggressive_limit_slippage: Decimal::new(20, 2),
            leg2_retry_delay: Duration::from_secs(3),
        }
    }
}

/// How a single saga execution ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RollOutcome {
    /// Trigger not met; no side effects.
    NotTriggered,
    /// Another worker owns this roll; no side effects.
    Contended,
    /// Position vanished or expired; task is `COMPLETED`.
    Completed,
    /// Both legs done; task is back in `IDLE` on the new symbol.
    Rolled,
    /// Close leg failed; the error was registered (`IDLE` or `FAILED`).
    Aborted,
    /// Shutdown hit during the opening leg; task remains `LEG1_CLOSED` for
    /// the next process to resume.
    Cancelled,
}

enum Leg1Outcome {
    Closed,
    Completed,
    Aborted,
}

/// Executes rolls for one task at a time.
pub struct RollSaga {
    exchange: Arc<dyn ExchangePort>,
    store: Arc<dyn TaskStore>,
    config: SagaConfig,
    shutdown: ShutdownSignal,
    observer: Arc<dyn EngineObserver>,
}

impl RollSaga {
    pub fn new(
        exchange: Arc<dyn ExchangePort>,
        store: Arc<dyn TaskStore>,
        config: SagaConfig,
        shutdown: ShutdownSignal,
        observer: Arc<dyn EngineObserver>,
    ) -> Self {
        Self {
            exchange,
            store,
            config,
            shutdown,
            observer,
        }
    }

    /// Entry point: carry `snapshot`'s task through the state machine.
    ///
    /// The snapshot is only trusted for routing; the authoritative row is
    /// re-read here and every transition is gated by the version CAS.
    pub async fn execute(
        &self,
        cred: &Credentials,
        snapshot: &Task,
        observed_price: Price,
    ) -> Result<RollOutcome> {
        let mut task = match self.store.get(snapshot.id) {
            Ok(task) => task,
            Err(StoreError::NotFound(id)) => {
                debug!(task_id = id, "task disappeared before execution");
                return Ok(RollOutcome::NotTriggered);
            }
            Err(err) => return Err(err).context("failed to load task"),
        };

        // Recovery short-circuit: the position is naked, close it out
        // regardless of market conditions.
        if task.status == TaskState::Leg1Closed {
            return self.process_leg2_loop(cred, &task).await;
        }

        if !task.should_roll(observed_price) {
            debug!(
                task_id = task.id,
                price = %observed_price,
                trigger = %task.trigger_price,
                "price is safe, no action"
            );
            return Ok(RollOutcome::NotTriggered);
        }

        info!(
            task_id = task.id,
            symbol = %task.current_option_symbol,
            price = %observed_price,
            trigger = %task.trigger_price,
            "trigger hit, initiating roll"
        );

        match self
            .store
            .update_state(task.id, TaskState::RollInitiated, task.version)
        {
            Ok(()) => {
                task.status = TaskState::RollInitiated;
                task.version += 1;
            }
            Err(StoreError::Contention(_)) => {
                debug!(task_id = task.id, "lost the roll lock to another worker");
                return Ok(RollOutcome::Contended);
            }
            Err(err) => return Err(err).context("failed to lock task"),
        }

        match self.process_leg1(cred, &mut task).await? {
            Leg1Outcome::Completed => Ok(RollOutcome::Completed),
            Leg1Outcome::Aborted => Ok(RollOutcome::Aborted),
            Leg1Outcome::Closed => self.process_leg2_loop(cred, &task).await,
        }
    }

    /// Close the currently held leg.
    async fn process_leg1(&self, cred: &Credentials, task: &mut Task) -> Result<Leg1Outcome> {
        match task.option_symbol() {
            Ok(symbol) => {
                let cutoff = symbol.expiry_instant() + self.config.expiry_grace;
                if Utc::now() > cutoff {
                    info!(
                        task_id = task.id,
                        symbol = %task.current_option_symbol,
                        "contract is past settlement, completing task"
                    );
                    self.complete(task)?;
                    return Ok(Leg1Outcome::Completed);
                }
            }
            Err(err) => {
                warn!(
                    task_id = task.id,
                    symbol = %task.current_option_symbol,
                    error = %err,
                    "cannot parse expiry, proceeding with close"
                );
            }
        }

        let position = match self
            .exchange
            .position(cred, &task.current_option_symbol)
            .await
        {
            Ok(position) => position,
            Err(err) => return self.abort_leg1(task, &err),
        };
        if position.is_flat() {
            info!(
                task_id = task.id,
                symbol = %task.current_option_symbol,
                "position no longer exists, completing task"
            );
            self.complete(task)?;
            return Ok(Leg1Outcome::Completed);
        }

        // The exchange is the source of truth for the held quantity and side.
        task.current_qty = position.quantity;
        let position_side = match position.side.or(task.target_side) {
            Some(side) => side,
            None => {
                let err = ExchangeError::InvalidRequest(format!(
                    "position side unknown for {}",
                    task.current_option_symbol
                ));
                return self.abort_leg1(task, &err);
            }
        };
        if task.target_side.is_none() {
            task.target_side = Some(position_side);
        }

        let mark = match self.exchange.mark_price(&task.current_option_symbol).await {
            Ok(mark) => mark,
            Err(err) => return self.abort_leg1(task, &err),
        };

        let close_side = position_side.inverse();
        let request = OrderRequest {
            symbol: task.current_option_symbol.clone(),
            side: close_side,
            order_type: OrderType::Limit,
            quantity: task.current_qty,
            price: Some(aggressive_limit(
                mark,
                close_side,
                self.config.aggressive_limit_slippage,
            )),
            reduce_only: true,
            time_in_force: Some(TimeInForce::ImmediateOrCancel),
            client_order_id: close_order_link_id(task.id, task.version),
        };
        match self.exchange.place_order(cred, request).await {
            Ok(order_id) => {
                info!(
                    task_id = task.id,
                    symbol = %task.current_option_symbol,
                    qty = %task.current_qty,
                    order_id = %order_id,
                    "close leg submitted"
                );
            }
            Err(err) => return self.abort_leg1(task, &err),
        }

        match self
            .store
            .update_state(task.id, TaskState::Leg1Closed, task.version)
        {
            Ok(()) => {
                task.status = TaskState::Leg1Closed;
                task.version += 1;
            }
            Err(err) => {
                // The close order landed; the opening leg must proceed. The
                // version reservation at the next attempt retries this
                // transition, and the recovery scan reconciles on restart.
                error!(
                    task_id = task.id,
                    error = %err,
                    "close order landed but checkpoint failed, continuing to open leg"
                );
            }
        }
        Ok(Leg1Outcome::Closed)
    }

    /// Open the replacement leg, retrying until success or shutdown.
    async fn process_leg2_loop(&self, cred: &Credentials, task: &Task) -> Result<RollOutcome> {
        loop {
            if self.shutdown.triggered() {
                return Ok(RollOutcome::Cancelled);
            }
            match self.leg2_attempt(cred, task).await {
                Ok(true) => {
                    self.observer.roll_completed();
                    info!(task_id = task.id, "roll completed");
                    return Ok(RollOutcome::Rolled);
                }
                Ok(false) => {
                    // Another path already finalized the row.
                    return Ok(RollOutcome::Rolled);
                }
                Err(err) => {
                    self.observer.order_failure();
                    warn!(
                        task_id = task.id,
                        error = %err,
                        "open leg attempt failed, retrying"
                    );
                }
            }
            if !self.shutdown.sleep(self.config.leg2_retry_delay).await {
                info!(
                    task_id = task.id,
                    "shutdown during open leg, task stays checkpointed for the next run"
                );
                return Ok(RollOutcome::Cancelled);
            }
        }
    }

    /// One opening attempt. Every failure here is retryable by design.
    /// Returns `Ok(false)` when the row turned out to be finalized already.
    async fn leg2_attempt(&self, cred: &Credentials, task: &Task) -> Result<bool> {
        // Re-read the row: earlier attempts may have burned versions, and a
        // checkpoint failure in leg 1 leaves the row behind the saga's view.
        let row = self.store.get(task.id).context("failed to reload task")?;
        if row.status == TaskState::Idle && row.current_option_symbol != task.current_option_symbol
        {
            warn!(task_id = task.id, "row already carries the new leg");
            return Ok(false);
        }
        let mut version = row.version;

        let current: OptionSymbol = task
            .current_option_symbol
            .parse()
            .with_context(|| format!("invalid option symbol {}", task.current_option_symbol))?;
        let mut chain = self
            .exchange
            .option_chain(&current.base, current.expiry)
            .await
            .context("failed to fetch option chain")?;
        chain.sort();
        let strike = next_strike(&chain, current.strike, current.kind)?;
        let new_symbol = current.with_strike(strike).to_string();

        // Reserve a fresh version for this attempt's idempotency key. This
        // also repairs a missed leg-1 checkpoint.
        self.store
            .update_state(task.id, TaskState::Leg1Closed, version)
            .context("failed to reserve attempt version")?;
        version += 1;

        let side = task.target_side.unwrap_or_else(|| {
            warn!(
                task_id = task.id,
                "no target side recorded, defaulting to Sell"
            );
            Side::Sell
        });
        let mark = self
            .exchange
            .mark_price(&new_symbol)
            .await
            .context("failed to fetch mark price for new leg")?;
        let request = OrderRequest {
            symbol: new_symbol.clone(),
            side,
            order_type: OrderType::Limit,
            quantity: task.current_qty,
            price: Some(aggressive_limit(
                mark,
                side,
                self.config.aggressive_limit_slippage,
            )),
            reduce_only: false,
            time_in_force: Some(TimeInForce::ImmediateOrCancel),
            client_order_id: open_order_link_id(task.id, version),
        };
        let order_id = self
            .exchange
            .place_order(cred, request)
            .await
            .context("failed to open new leg")?;
        info!(
            task_id = task.id,
            symbol = %new_symbol,
            qty = %task.current_qty,
            order_id = %order_id,
            "open leg submitted"
        );

        if let Err(err) = self
            .store
            .update_symbol(task.id, &new_symbol, task.current_qty, version)
        {
            // The roll is economically done; the next load reconciles.
            error!(
                task_id = task.id,
                error = %err,
                "open order landed but symbol update failed"
            );
        }
        Ok(true)
    }

    fn complete(&self, task: &mut Task) -> Result<()> {
        self.store
            .update_state(task.id, TaskState::Completed, task.version)
            .context("failed to complete task")?;
        task.status = TaskState::Completed;
        task.version += 1;
        self.observer.task_completed();
        Ok(())
    }

    fn abort_leg1(&self, task: &Task, err: &ExchangeError) -> Result<Leg1Outcome> {
        self.observer.order_failure();
        let disposition = self
            .store
            .register_error(task.id, err)
            .context("failed to register error")?;
        warn!(
            task_id = task.id,
            error = %err,
            disposition = disposition.as_str(),
            "close leg aborted"
        );
        Ok(Leg1Outcome::Aborted)
    }
}

/// Limit price past the mark on the taking side: buys pay up, sells give in.
fn aggressive_limit(mark: Price, side: Side, slippage: Decimal) -> Price {
    match side {
        Side::Buy => mark * (Decimal::ONE + slippage),
        Side::Sell => mark * (Decimal::ONE - slippage),
    }
}

/// Failure modes of the next-strike rule; all retryable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NextStrikeError {
    #[error("option chain is empty")]
    EmptyChain,
    #[error("strike {0} is already at the edge of the chain")]
    Edge(Decimal),
}

/// Pick the neighbouring strike in roll direction from an ascending chain.
///
/// When the current strike is missing from the chain, the nearest strike
/// strictly beyond it (greater for calls, less for puts) is chosen.
pub fn next_strike(
    chain: &[Decimal],
    current: Decimal,
    kind: OptionKind,
) -> Result<Decimal, NextStrikeError> {
    if chain.is_empty() {
        return Err(NextStrikeError::EmptyChain);
    }
    let picked = match chain.binary_search(&current) {
        Ok(index) => match kind {
            OptionKind::Call => chain.get(index + 1),
            OptionKind::Put => index.checked_sub(1).and_then(|i| chain.get(i)),
        },
        Err(insertion) => match kind {
            OptionKind::Call => chain.get(insertion),
            OptionKind::Put => insertion.checked_sub(1).and_then(|i| chain.get(i)),
        },
    };
    picked.copied().ok_or(NextStrikeError::Edge(current))
}
