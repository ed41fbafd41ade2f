//! End-to-end scenarios driven through the public `session::spawn` handle,
//! each against a `FixedDataSource` of hand-built events. Mirrors the
//! session-loop tests colocated in `src/session.rs`, at the granularity of
//! whole trading scenarios rather than single mechanisms.

use std::collections::VecDeque;
use std::path::PathBuf;

use broker_replay_sim::config::{FeeTable, OverflowPolicy, SessionConfig, WsConfig};
use broker_replay_sim::core_types::{Nanos, Seq, Side, Symbol};
use broker_replay_sim::data_source::DataSource;
use broker_replay_sim::errors::SimResult;
use broker_replay_sim::event::{CorporateActionKind, CorporateActionData, Event, EventPayload, QuoteData, RatioDecimal, TradeData};
use broker_replay_sim::matching_engine::SubmitRequest;
use broker_replay_sim::money::Price;
use broker_replay_sim::orderbook::{OrderKind, OrderStatus, TimeInForce};
use broker_replay_sim::session::{self, SessionStatus};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

struct FixedDataSource {
    events: VecDeque<Event>,
}

impl DataSource for FixedDataSource {
    fn next_batch(&mut self, max: usize) -> SimResult<Vec<Event>> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some(event) = self.events.pop_front() else {
                break;
            };
            out.push(event);
        }
        Ok(out)
    }

    fn seek(&mut self, _cursor: (Nanos, Seq)) -> SimResult<()> {
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.events.is_empty()
    }
}

fn base_config() -> SessionConfig {
    SessionConfig {
        symbols: vec!["AAPL".into()],
        start: chrono::Utc::now(),
        end: chrono::Utc::now(),
        initial_capital: Decimal::from(100_000),
        speed_factor: 0.0,
        enable_latency: false,
        enable_slippage: false,
        enable_market_impact: false,
        enable_partial_fills: false,
        enable_margin_call_checks: false,
        enable_forced_liquidation: false,
        enable_wal: false,
        fixed_latency_us: 0,
        random_latency_max_us: 0,
        fixed_slippage_bps: 0.0,
        random_slippage_max_bps: 0.0,
        market_impact_bps: 0.0,
        market_impact_per_share: 0.0,
        market_impact_sqrt_coef: 0.0,
        partial_fill_probability: 0.0,
        rejection_probability: 0.0,
        allow_shorting: true,
        max_position_value: None,
        max_single_order_value: None,
        maintenance_margin_pct: Decimal::new(25, 2),
        fee_table: FeeTable::default(),
        ws: WsConfig::default(),
        checkpoint_interval_events: 1_000_000,
        wal_directory: None,
        event_queue_capacity: 10_000,
        event_queue_overflow_policy: OverflowPolicy::DropOldest,
    }
}

fn trade(ts: Nanos, seq: Seq, symbol: &Symbol, price: i64, size: u32) -> Event {
    Event {
        timestamp_ns: ts,
        symbol: symbol.clone(),
        seq,
        payload: EventPayload::Trade(TradeData {
            price: Price::new(Decimal::from(price)),
            size,
            conditions: vec![],
            exchange: 1,
            sip_ts_ns: ts,
        }),
    }
}

fn market_buy(symbol: &Symbol, qty: u64) -> SubmitRequest {
    SubmitRequest {
        id: uuid::Uuid::new_v4(),
        client_id: None,
        symbol: symbol.clone(),
        side: Side::Buy,
        kind: OrderKind::Market,
        tif: TimeInForce::Day,
        qty,
        limit_price: None,
        stop_price: None,
        trail_price: None,
        trail_percent: None,
    }
}

async fn spawn_with(events: Vec<Event>, config: SessionConfig) -> broker_replay_sim::session::SessionHandle {
    let source = Box::new(FixedDataSource { events: VecDeque::from(events) });
    let (fanout_tx, _fanout_rx) = mpsc::unbounded_channel();
    session::spawn(
        uuid::Uuid::new_v4(),
        config,
        source,
        PathBuf::from("/tmp/broker-sim-scenario-test"),
        fanout_tx,
    )
}

/// Spec scenario: limit buy resting below every printed trade never fills.
#[tokio::test]
async fn limit_order_never_filled() {
    let symbol = Symbol::new("AAPL");
    let events = vec![trade(0, 1, &symbol, 150, 100), trade(1, 2, &symbol, 151, 100)];
    let handle = spawn_with(events, base_config()).await;
    handle.start().await.unwrap();

    let order = handle
        .submit(SubmitRequest {
            id: uuid::Uuid::new_v4(),
            client_id: None,
            symbol: symbol.clone(),
            side: Side::Buy,
            kind: OrderKind::Limit,
            tif: TimeInForce::Gtc,
            qty: 10,
            limit_price: Some(Price::new(Decimal::from(100))),
            stop_price: None,
            trail_price: None,
            trail_percent: None,
        })
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Accepted);

    for _ in 0..50 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let resting = handle.order(&symbol, order.id).await.unwrap();
    assert_eq!(resting.status, OrderStatus::Accepted);
    assert_eq!(resting.filled_qty, 0);
}

/// Spec scenario: a market buy fills across two trade prints of different
/// size, producing a size-weighted average fill price.
#[tokio::test]
async fn partial_fill_by_trade_size() {
    let symbol = Symbol::new("AAPL");

    let e1 = Event {
        timestamp_ns: 0,
        symbol: symbol.clone(),
        seq: 1,
        payload: EventPayload::Trade(TradeData {
            price: Price::new(Decimal::new(15000, 2)),
            size: 40,
            conditions: vec![],
            exchange: 1,
            sip_ts_ns: 0,
        }),
    };
    let e2 = Event {
        timestamp_ns: 1,
        symbol: symbol.clone(),
        seq: 2,
        payload: EventPayload::Trade(TradeData {
            price: Price::new(Decimal::new(15010, 2)),
            size: 100,
            conditions: vec![],
            exchange: 1,
            sip_ts_ns: 1,
        }),
    };

    let handle = spawn_with(vec![e1, e2], base_config()).await;
    handle.start().await.unwrap();

    let order = handle.submit(market_buy(&symbol, 100)).await.unwrap();
    assert_eq!(order.status, OrderStatus::Accepted);

    for _ in 0..50 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let filled = handle.order(&symbol, order.id).await.unwrap();
    assert_eq!(filled.status, OrderStatus::Filled);
    assert_eq!(filled.filled_qty, 100);
    assert_eq!(filled.avg_fill_price, Some(Price::new(Decimal::new(15006, 2))));

    let account = handle.account().await;
    // 40 @ 150.00 + 60 @ 150.10, no fees on a buy.
    let expected_cash = Decimal::from(100_000) - (Decimal::new(15000, 2) * Decimal::from(40) + Decimal::new(15010, 2) * Decimal::from(60));
    assert_eq!(account.cash(), expected_cash);
}

/// Spec scenario: a 2:1 split rescales both the open order and the
/// position, and an inverse 1:2 split afterwards returns qty/price to their
/// pre-split values modulo rounding.
#[tokio::test]
async fn split_then_inverse_split_round_trips() {
    let symbol = Symbol::new("AAPL");
    let events = vec![trade(0, 1, &symbol, 150, 1000)];
    let handle = spawn_with(events, base_config()).await;
    handle.start().await.unwrap();

    let filled = handle.submit(market_buy(&symbol, 100)).await.unwrap();
    assert_eq!(filled.status, OrderStatus::Accepted);

    let resting = handle
        .submit(SubmitRequest {
            id: uuid::Uuid::new_v4(),
            client_id: None,
            symbol: symbol.clone(),
            side: Side::Buy,
            kind: OrderKind::Limit,
            tif: TimeInForce::Gtc,
            qty: 10,
            limit_price: Some(Price::new(Decimal::new(14000, 2))),
            stop_price: None,
            trail_price: None,
            trail_percent: None,
        })
        .await
        .unwrap();

    for _ in 0..50 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let position_before = handle
        .positions()
        .await
        .into_iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, p)| p)
        .unwrap();
    assert_eq!(position_before.qty(), 100);

    handle.apply_split(symbol.clone(), Decimal::from(2)).await.unwrap();

    let position_after = handle
        .positions()
        .await
        .into_iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, p)| p)
        .unwrap();
    assert_eq!(position_after.qty(), 200);

    let order_after = handle.order(&symbol, resting.id).await.unwrap();
    assert_eq!(order_after.qty, 20);
    assert_eq!(order_after.limit_price, Some(Price::new(Decimal::new(7000, 2))));

    handle.apply_split(symbol.clone(), Decimal::new(5, 1)).await.unwrap();

    let position_round_trip = handle
        .positions()
        .await
        .into_iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, p)| p)
        .unwrap();
    assert_eq!(position_round_trip.qty(), 100);

    let order_round_trip = handle.order(&symbol, resting.id).await.unwrap();
    assert_eq!(order_round_trip.qty, 10);
    assert_eq!(order_round_trip.limit_price, Some(Price::new(Decimal::new(14000, 2))));
}

/// Spec scenario: a per-share dividend credits cash proportional to the
/// held quantity and leaves the position itself untouched.
#[tokio::test]
async fn dividend_credits_cash() {
    let symbol = Symbol::new("AAPL");
    let events = vec![trade(0, 1, &symbol, 150, 1000)];
    let handle = spawn_with(events, base_config()).await;
    handle.start().await.unwrap();

    handle.submit(market_buy(&symbol, 100)).await.unwrap();

    for _ in 0..50 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let cash_before = handle.account().await.cash();
    handle
        .apply_dividend(symbol.clone(), Price::new(Decimal::new(50, 2)))
        .await
        .unwrap();
    let cash_after = handle.account().await.cash();

    assert_eq!(cash_after, cash_before + Decimal::new(50, 2) * Decimal::from(100));
}

/// Spec scenario: a short position whose mark moves far enough against it
/// trips a margin call and forced liquidation closes the position back out.
#[tokio::test]
async fn forced_liquidation_closes_short_on_margin_call() {
    let symbol = Symbol::new("AAPL");
    let events = vec![
        trade(0, 1, &symbol, 100, 1000),
        trade(1, 2, &symbol, 170, 1000),
        trade(2, 3, &symbol, 170, 1000),
    ];
    let mut config = base_config();
    config.initial_capital = Decimal::from(10_000);
    config.enable_margin_call_checks = true;
    config.enable_forced_liquidation = true;

    let handle = spawn_with(events, config).await;
    handle.start().await.unwrap();

    let order = handle
        .submit(SubmitRequest {
            id: uuid::Uuid::new_v4(),
            client_id: None,
            symbol: symbol.clone(),
            side: Side::Sell,
            kind: OrderKind::Market,
            tif: TimeInForce::Day,
            qty: 100,
            limit_price: None,
            stop_price: None,
            trail_price: None,
            trail_percent: None,
        })
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Accepted);

    for _ in 0..80 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let positions = handle.positions().await;
    assert!(
        positions.iter().all(|(s, p)| s != &symbol || p.qty() == 0),
        "forced liquidation should have flattened the short"
    );

    let closed = handle
        .orders(None)
        .await
        .into_iter()
        .find(|o| o.symbol == symbol && o.side == Side::Buy && o.kind == OrderKind::Market)
        .expect("forced liquidation should have submitted a synthesized closing buy");
    assert_eq!(closed.status, OrderStatus::Filled);
}

/// Spec round-trip law: submitting then canceling an order before any trade
/// crosses it leaves cash and positions unchanged.
#[tokio::test]
async fn cancel_before_match_leaves_ledger_unchanged() {
    let symbol = Symbol::new("AAPL");
    let events = vec![trade(10, 1, &symbol, 150, 100)];
    let handle = spawn_with(events, base_config()).await;
    handle.start().await.unwrap();

    let cash_before = handle.account().await.cash();

    let order = handle
        .submit(SubmitRequest {
            id: uuid::Uuid::new_v4(),
            client_id: None,
            symbol: symbol.clone(),
            side: Side::Buy,
            kind: OrderKind::Limit,
            tif: TimeInForce::Gtc,
            qty: 10,
            limit_price: Some(Price::new(Decimal::from(140))),
            stop_price: None,
            trail_price: None,
            trail_percent: None,
        })
        .await
        .unwrap();
    let canceled = handle.cancel(order.id).await.unwrap();
    assert_eq!(canceled.status, OrderStatus::Canceled);

    for _ in 0..50 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let cash_after = handle.account().await.cash();
    assert_eq!(cash_before, cash_after);
    assert!(handle.positions().await.is_empty());
}

/// Spec boundary: a session with no events in its time range completes
/// immediately without ever accepting an order.
#[tokio::test]
async fn empty_time_range_completes_immediately() {
    let handle = spawn_with(vec![], base_config()).await;
    handle.start().await.unwrap();

    for _ in 0..50 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(handle.status(), SessionStatus::Completed);
}

/// Spec boundary: a market order submitted before any trade prints stays
/// Accepted (no liquidity to cross against) until one arrives.
#[tokio::test]
async fn market_order_against_empty_tape_stays_accepted_until_a_trade_arrives() {
    let symbol = Symbol::new("AAPL");
    let events = vec![
        Event {
            timestamp_ns: 0,
            symbol: symbol.clone(),
            seq: 1,
            payload: EventPayload::Quote(QuoteData {
                bid: Price::new(Decimal::from(99)),
                bid_size: 10,
                ask: Price::new(Decimal::from(101)),
                ask_size: 10,
            }),
        },
        trade(1, 2, &symbol, 100, 50),
    ];
    let handle = spawn_with(events, base_config()).await;
    handle.start().await.unwrap();

    let order = handle.submit(market_buy(&symbol, 50)).await.unwrap();
    assert_eq!(order.status, OrderStatus::Accepted);

    for _ in 0..50 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let filled = handle.order(&symbol, order.id).await.unwrap();
    assert_eq!(filled.status, OrderStatus::Filled);
}

/// Corporate-action event fed through market data (rather than the
/// `apply_split`/`apply_dividend` control-plane calls) exercises the same
/// rescaling path via `process_event`.
#[tokio::test]
async fn corporate_action_event_applies_split_from_market_data() {
    let symbol = Symbol::new("AAPL");
    let events = vec![
        trade(0, 1, &symbol, 150, 1000),
        Event {
            timestamp_ns: 1,
            symbol: symbol.clone(),
            seq: 2,
            payload: EventPayload::CorporateAction(CorporateActionData {
                kind: CorporateActionKind::Split { ratio: RatioDecimal(Decimal::from(2)) },
            }),
        },
    ];
    let handle = spawn_with(events, base_config()).await;
    handle.start().await.unwrap();

    handle.submit(market_buy(&symbol, 100)).await.unwrap();

    for _ in 0..50 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let position = handle
        .positions()
        .await
        .into_iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, p)| p)
        .unwrap();
    assert_eq!(position.qty(), 200);
}

/// Spec scenario: a sell stop triggers and fills across the trade that
/// activates it and a later one, rather than sitting orphaned forever once
/// converted to market (the activated order only ever has `kind == Stop`;
/// matching must recognize it by `activated && limit_price.is_none()`, not
/// by kind).
#[tokio::test]
async fn stop_order_activation_fills_across_trades() {
    let symbol = Symbol::new("AAPL");
    let events = vec![
        trade(0, 1, &symbol, 100, 50),
        trade(1, 2, &symbol, 94, 5),
        trade(2, 3, &symbol, 93, 20),
    ];
    let handle = spawn_with(events, base_config()).await;
    handle.start().await.unwrap();

    let order = handle
        .submit(SubmitRequest {
            id: uuid::Uuid::new_v4(),
            client_id: None,
            symbol: symbol.clone(),
            side: Side::Sell,
            kind: OrderKind::Stop,
            tif: TimeInForce::Gtc,
            qty: 10,
            limit_price: None,
            stop_price: Some(Price::new(Decimal::from(95))),
            trail_price: None,
            trail_percent: None,
        })
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Accepted);

    for _ in 0..50 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    // A short of 10 shares: the stop triggered at 94 (first trade printing
    // through the 95 stop) and the remainder filled against the 93 print.
    let position = handle
        .positions()
        .await
        .into_iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, p)| p)
        .unwrap();
    assert_eq!(position.qty(), -10);
}

/// Spec scenario: a `Fok` order either fills its entire quantity on the
/// first matching opportunity or rejects outright — it must never leave a
/// partial fill behind the way `Ioc` does.
#[tokio::test]
async fn fok_market_order_rejects_rather_than_partial_filling() {
    let symbol = Symbol::new("AAPL");
    // Only 40 shares ever print; a 100-share Fok buy cannot be covered and
    // must reject with zero fills rather than taking the 40 available.
    let events = vec![trade(0, 1, &symbol, 150, 40)];
    let handle = spawn_with(events, base_config()).await;
    handle.start().await.unwrap();

    handle
        .submit(SubmitRequest {
            id: uuid::Uuid::new_v4(),
            client_id: None,
            symbol: symbol.clone(),
            side: Side::Buy,
            kind: OrderKind::Market,
            tif: TimeInForce::Fok,
            qty: 100,
            limit_price: None,
            stop_price: None,
            trail_price: None,
            trail_percent: None,
        })
        .await
        .unwrap();

    for _ in 0..50 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    assert!(handle.positions().await.is_empty());
    assert_eq!(handle.account().await.cash(), Decimal::from(100_000));
}

/// Spec scenario: an `Ioc` limit order only gets one matching opportunity.
/// If the first trade it is exposed to doesn't cross, it cancels instead of
/// resting for a later, crossing print.
#[tokio::test]
async fn ioc_limit_order_cancels_instead_of_resting_for_a_later_cross() {
    let symbol = Symbol::new("AAPL");
    // First print (160) misses the 149 limit; the second (148) would cross
    // it, but only if the order were still resting.
    let events = vec![trade(0, 1, &symbol, 160, 50), trade(1, 2, &symbol, 148, 50)];
    let handle = spawn_with(events, base_config()).await;
    handle.start().await.unwrap();

    handle
        .submit(SubmitRequest {
            id: uuid::Uuid::new_v4(),
            client_id: None,
            symbol: symbol.clone(),
            side: Side::Buy,
            kind: OrderKind::Limit,
            tif: TimeInForce::Ioc,
            qty: 10,
            limit_price: Some(Price::new(Decimal::from(149))),
            stop_price: None,
            trail_price: None,
            trail_percent: None,
        })
        .await
        .unwrap();

    for _ in 0..50 {
        if handle.status() == SessionStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    assert!(handle.positions().await.is_empty());
    assert_eq!(handle.account().await.cash(), Decimal::from(100_000));
}
