//! End-to-end saga scenarios against the mock exchange and an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use rust_decimal_macros::dec;
use tokio::time::sleep;

use optroll_broker::{Credentials, ExchangeError, ExchangePort};
use optroll_core::{OrderType, Side, Task, TaskState, TimeInForce};
use optroll_engine::{NoopObserver, RollOutcome, RollSaga, SagaConfig, ShutdownSignal};
use optroll_store::{SqliteTaskStore, TaskStore};
use optroll_test_utils::MockExchange;

const CALL_SYMBOL: &str = "BTC-26DEC27-100000-C";
const NEXT_CALL_SYMBOL: &str = "BTC-26DEC27-101000-C";
const PUT_SYMBOL: &str = "ETH-30JAN28-3000-P";

fn call_expiry() -> NaiveDate {
    NaiveDate::from_ymd_opt(2027, 12, 26).unwrap()
}

fn put_expiry() -> NaiveDate {
    NaiveDate::from_ymd_opt(2028, 1, 30).unwrap()
}

fn cred() -> Credentials {
    Credentials {
        api_key: "test-key".into(),
        api_secret: "test-secret".into(),
    }
}

struct Harness {
    store: Arc<dyn TaskStore>,
    exchange: MockExchange,
    saga: Arc<RollSaga>,
    shutdown: ShutdownSignal,
}

fn harness() -> Harness {
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
    let exchange = MockExchange::new();
    let shutdown = ShutdownSignal::manual();
    let saga = Arc::new(RollSaga::new(
        Arc::new(exchange.clone()),
        store.clone(),
        SagaConfig {
            leg2_retry_delay: Duration::from_millis(30),
            ..SagaConfig::default()
        },
        shutdown.clone(),
        Arc::new(NoopObserver),
    ));
    Harness {
        store,
        exchange,
        saga,
        shutdown,
    }
}

fn call_task(store: &Arc<dyn TaskStore>) -> Task {
    let mut task = Task {
        id: 0,
        owner_id: 1,
        credential_id: 1,
        current_option_symbol: CALL_SYMBOL.into(),
        underlying_symbol: "BTCUSDT".into(),
        target_side: Some(Side::Sell),
        current_qty: dec!(0.1),
        trigger_price: dec!(100000),
        next_strike_step: dec!(1000),
        status: TaskState::Idle,
        version: 0,
        last_error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.create(&mut task).unwrap();
    task
}

fn arm_call_market(exchange: &MockExchange) {
    exchange.set_position(CALL_SYMBOL, Side::Sell, dec!(0.1));
    exchange.set_mark_price(CALL_SYMBOL, dec!(1500));
    exchange.set_mark_price(NEXT_CALL_SYMBOL, dec!(1200));
    exchange.set_chain(
        "BTC",
        call_expiry(),
        vec![dec!(99000), dec!(100000), dec!(101000), dec!(102000)],
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_call_roll() -> Result<()> {
    let h = harness();
    let task = call_task(&h.store);
    arm_call_market(&h.exchange);

    let outcome = h.saga.execute(&cred(), &task, dec!(100500)).await?;
    assert_eq!(outcome, RollOutcome::Rolled);

    let row = h.store.get(task.id)?;
    assert_eq!(row.current_option_symbol, NEXT_CALL_SYMBOL);
    assert_eq!(row.status, TaskState::Idle);
    assert_eq!(row.version, 5);
    assert_eq!(row.current_qty, dec!(0.1));

    let orders = h.exchange.orders();
    assert_eq!(orders.len(), 2);

    let close = &orders[0].request;
    assert_eq!(close.client_order_id, format!("close-{}-v2", task.id));
    assert_eq!(close.symbol, CALL_SYMBOL);
    assert_eq!(close.side, Side::Buy);
    assert_eq!(close.order_type, OrderType::Limit);
    assert_eq!(close.price, Some(dec!(1800.00)));
    assert!(close.reduce_only);
    assert_eq!(close.time_in_force, Some(TimeInForce::ImmediateOrCancel));

    let open = &orders[1].request;
    assert_eq!(open.client_order_id, format!("open-{}-v4", task.id));
    assert_eq!(open.symbol, NEXT_CALL_SYMBOL);
    assert_eq!(open.side, Side::Sell);
    assert_eq!(open.price, Some(dec!(960.00)));
    assert!(!open.reduce_only);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn safe_price_leaves_task_untouched() -> Result<()> {
    let h = harness();
    let task = call_task(&h.store);
    arm_call_market(&h.exchange);

    let outcome = h.saga.execute(&cred(), &task, dec!(99999)).await?;
    assert_eq!(outcome, RollOutcome::NotTriggered);
    assert_eq!(h.store.get(task.id)?.version, 1);
    assert!(h.exchange.orders().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_resumes_at_open_leg() -> Result<()> {
    let h = harness();
    let task = call_task(&h.store);
    arm_call_market(&h.exchange);
    // Simulate a previous process dying right after the close checkpoint.
    h.store
        .update_state(task.id, TaskState::RollInitiated, 1)?;
    h.store.update_state(task.id, TaskState::Leg1Closed, 2)?;
    let checkpointed = h.store.get(task.id)?;

    // The synthetic price is irrelevant; the short-circuit skips the trigger.
    let outcome = h.saga.execute(&cred(), &checkpointed, dec!(0)).await?;
    assert_eq!(outcome, RollOutcome::Rolled);

    let row = h.store.get(task.id)?;
    assert_eq!(row.current_option_symbol, NEXT_CALL_SYMBOL);
    assert_eq!(row.status, TaskState::Idle);
    assert_eq!(row.version, 5);

    // Only the opening leg ran; the close had already happened.
    let orders = h.exchange.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(
        orders[0].request.client_order_id,
        format!("open-{}-v4", task.id)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_close_failure_rewinds_to_idle() -> Result<()> {
    let h = harness();
    let task = call_task(&h.store);
    arm_call_market(&h.exchange);
    h.exchange
        .queue_order_failure(ExchangeError::Exchange("deadline exceeded".into()));

    let outcome = h.saga.execute(&cred(), &task, dec!(100500)).await?;
    assert_eq!(outcome, RollOutcome::Aborted);

    let row = h.store.get(task.id)?;
    assert_eq!(row.status, TaskState::Idle);
    assert_eq!(row.version, 3);
    assert!(row.last_error.clone().unwrap().contains("deadline exceeded"));

    // Next tick picks the task up again and the roll completes.
    let outcome = h.saga.execute(&cred(), &row, dec!(100500)).await?;
    assert_eq!(outcome, RollOutcome::Rolled);

    let row = h.store.get(task.id)?;
    assert_eq!(row.current_option_symbol, NEXT_CALL_SYMBOL);
    assert_eq!(row.status, TaskState::Idle);

    let orders = h.exchange.orders();
    assert_eq!(orders.len(), 2);
    assert_eq!(
        orders[0].request.client_order_id,
        format!("close-{}-v4", task.id)
    );
    assert_eq!(
        orders[1].request.client_order_id,
        format!("open-{}-v6", task.id)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_close_failure_marks_task_failed() -> Result<()> {
    let h = harness();
    let task = call_task(&h.store);
    arm_call_market(&h.exchange);
    h.exchange
        .queue_order_failure(ExchangeError::Exchange("insufficient margin".into()));

    let outcome = h.saga.execute(&cred(), &task, dec!(100500)).await?;
    assert_eq!(outcome, RollOutcome::Aborted);

    let row = h.store.get(task.id)?;
    assert_eq!(row.status, TaskState::Failed);
    assert!(row.last_error.unwrap().contains("insufficient margin"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn open_leg_retries_forever_and_survives_shutdown() -> Result<()> {
    let h = harness();
    let task = call_task(&h.store);
    arm_call_market(&h.exchange);
    h.store
        .update_state(task.id, TaskState::RollInitiated, 1)?;
    h.store.update_state(task.id, TaskState::Leg1Closed, 2)?;
    let checkpointed = h.store.get(task.id)?;
    // The exchange rejects every opening order outright.
    h.exchange
        .fail_orders_matching("open-", "insufficient margin");

    let saga = h.saga.clone();
    let credentials = cred();
    let handle =
        tokio::spawn(async move { saga.execute(&credentials, &checkpointed, dec!(0)).await });

    // Let several attempts burn through; the task must never go FAILED.
    sleep(Duration::from_millis(150)).await;
    let row = h.store.get(task.id)?;
    assert_eq!(row.status, TaskState::Leg1Closed);
    assert!(row.version > 3, "each attempt reserves a fresh version");

    h.shutdown.trigger();
    let outcome = handle.await??;
    assert_eq!(outcome, RollOutcome::Cancelled);
    assert_eq!(h.store.get(task.id)?.status, TaskState::Leg1Closed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_contract_completes_without_orders() -> Result<()> {
    let h = harness();
    let mut task = call_task(&h.store);
    // Rewrite the symbol to one that settled long ago.
    task.current_option_symbol = "BTC-26DEC25-100000-C".into();
    let expired = task.clone();
    {
        // Store the expired symbol so the saga sees it on its fresh read.
        let row = h.store.get(task.id).unwrap();
        h.store
            .update_state(task.id, TaskState::RollInitiated, row.version)
            .unwrap();
        h.store
            .update_symbol(task.id, &expired.current_option_symbol, dec!(0.1), 2)
            .unwrap();
    }

    let outcome = h.saga.execute(&cred(), &expired, dec!(100500)).await?;
    assert_eq!(outcome, RollOutcome::Completed);
    assert_eq!(h.store.get(task.id)?.status, TaskState::Completed);
    assert!(h.exchange.orders().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn vanished_position_completes_task() -> Result<()> {
    let h = harness();
    let task = call_task(&h.store);
    arm_call_market(&h.exchange);
    h.exchange.clear_position(CALL_SYMBOL);

    let outcome = h.saga.execute(&cred(), &task, dec!(100500)).await?;
    assert_eq!(outcome, RollOutcome::Completed);
    assert_eq!(h.store.get(task.id)?.status, TaskState::Completed);
    assert!(h.exchange.orders().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn put_rolls_to_the_strike_below() -> Result<()> {
    let h = harness();
    let mut task = Task {
        id: 0,
        owner_id: 1,
        credential_id: 1,
        current_option_symbol: PUT_SYMBOL.into(),
        underlying_symbol: "ETHUSDT".into(),
        target_side: Some(Side::Sell),
        current_qty: dec!(1),
        trigger_price: dec!(3000),
        next_strike_step: dec!(100),
        status: TaskState::Idle,
        version: 0,
        last_error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    h.store.create(&mut task).unwrap();
    h.exchange.set_position(PUT_SYMBOL, Side::Sell, dec!(1));
    h.exchange.set_mark_price(PUT_SYMBOL, dec!(50));
    h.exchange
        .set_mark_price("ETH-30JAN28-2900-P", dec!(40));
    h.exchange.set_chain(
        "ETH",
        put_expiry(),
        vec![dec!(2800), dec!(2900), dec!(3000), dec!(3100)],
    );

    let outcome = h.saga.execute(&cred(), &task, dec!(2990)).await?;
    assert_eq!(outcome, RollOutcome::Rolled);

    let row = h.store.get(task.id)?;
    assert_eq!(row.current_option_symbol, "ETH-30JAN28-2900-P");
    assert_eq!(row.status, TaskState::Idle);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn position_quantity_overrides_task_quantity() -> Result<()> {
    let h = harness();
    let task = call_task(&h.store);
    arm_call_market(&h.exchange);
    // Exchange reports a different size than the stale task row.
    h.exchange.set_position(CALL_SYMBOL, Side::Sell, dec!(0.3));

    let outcome = h.saga.execute(&cred(), &task, dec!(100500)).await?;
    assert_eq!(outcome, RollOutcome::Rolled);

    let orders = h.exchange.orders();
    assert_eq!(orders[0].request.quantity, dec!(0.3));
    assert_eq!(orders[1].request.quantity, dec!(0.3));
    assert_eq!(h.store.get(task.id)?.current_qty, dec!(0.3));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_idempotency_keys_execute_once() -> Result<()> {
    let h = harness();
    let task = call_task(&h.store);
    arm_call_market(&h.exchange);

    let first = h.saga.execute(&cred(), &task, dec!(100500)).await?;
    assert_eq!(first, RollOutcome::Rolled);
    let placed = h.exchange.orders().len();

    // Replaying an order with an already-seen key must not execute again.
    let replay = h.exchange.orders()[0].request.clone();
    let replay_id = h
        .exchange
        .place_order(&cred(), replay)
        .await
        .expect("duplicate submission is a no-op");
    assert_eq!(replay_id, h.exchange.orders()[0].order_id);
    assert_eq!(h.exchange.orders().len(), placed);
    Ok(())
}
