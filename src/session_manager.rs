//! SessionManager (C9): the process-wide registry of sessions.
//!
//! Grounded on the teacher's `websocket::connection::ConnectionManager`
//! generalized from a connection registry to a session registry: a
//! `DashMap` keyed store guarded by capacity, with lifecycle operations
//! that delegate the actual work to each `SessionHandle` (spec §4.8
//! "a registry mapping `session_id -> Session`").

use crate::config::{AppConfig, SessionConfig};
use crate::core_types::{Nanos, OrderId, SessionId, Symbol};
use crate::data_source::{CsvDataSource, DataSource};
use crate::errors::{SimError, SimResult};
use crate::event::Event;
use crate::fanout::Fanout;
use crate::ledger::{Account, Position};
use crate::matching_engine::SubmitRequest;
use crate::money::Price;
use crate::orderbook::{Order, OrderStatus};
use crate::session::{self, SessionHandle, SessionStatus};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A point-in-time account + position snapshot (spec §4.8 `get_performance`).
#[derive(Debug, Clone)]
pub struct PerformanceSnapshot {
    pub account: Account,
    pub positions: Vec<(Symbol, Position)>,
    pub events_processed: u64,
    pub watermark_ns: Nanos,
}

/// Owns every session, shared data root, and the process-wide Fanout.
pub struct SessionManager {
    app_config: AppConfig,
    sessions: DashMap<SessionId, SessionHandle>,
    fanout: Arc<Fanout>,
    fanout_tx: mpsc::UnboundedSender<(SessionId, Event)>,
}

impl SessionManager {
    /// Builds the manager and spawns the background task that pipes every
    /// session's outbound events into the shared Fanout (spec §4.7 step 6
    /// "hand resulting outbound Events to Fanout.enqueue").
    pub fn new(app_config: AppConfig, fanout: Arc<Fanout>) -> Arc<Self> {
        let (fanout_tx, mut fanout_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            app_config,
            sessions: DashMap::new(),
            fanout: fanout.clone(),
            fanout_tx,
        });
        tokio::spawn(async move {
            while let Some((session_id, event)) = fanout_rx.recv().await {
                fanout.publish(session_id, &event);
            }
        });
        manager
    }

    /// Creates and starts a new Session in the `Created` state (spec §4.8
    /// `create(config) -> id`). Enforces `max_sessions`.
    pub fn create(&self, config: SessionConfig) -> SimResult<SessionId> {
        config.validate()?;
        if self.sessions.len() >= self.app_config.max_sessions {
            return Err(SimError::RejectedByPolicy(format!(
                "max_sessions ({}) reached",
                self.app_config.max_sessions
            )));
        }

        let symbols: Vec<Symbol> = config.symbols.iter().map(Symbol::new).collect();
        let t_start = config
            .start
            .timestamp_nanos_opt()
            .unwrap_or_else(|| config.start.timestamp() * 1_000_000_000);
        let t_end = config
            .end
            .timestamp_nanos_opt()
            .unwrap_or_else(|| config.end.timestamp() * 1_000_000_000);

        let source: Box<dyn DataSource> = Box::new(CsvDataSource::open(
            self.app_config.data_root.clone(),
            &symbols,
            t_start,
            t_end,
        )?);

        let session_id = uuid::Uuid::new_v4();
        let handle = session::spawn(
            session_id,
            config,
            source,
            self.app_config.wal_root.clone(),
            self.fanout_tx.clone(),
        );
        self.sessions.insert(session_id, handle);
        tracing::info!(session_id = %session_id, "session created");
        Ok(session_id)
    }

    pub fn get(&self, session_id: SessionId) -> SimResult<SessionHandle> {
        self.sessions
            .get(&session_id)
            .map(|h| h.clone())
            .ok_or_else(|| SimError::NotFound(format!("session {session_id} not found")))
    }

    pub fn list(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    pub async fn start(&self, session_id: SessionId) -> SimResult<()> {
        self.get(session_id)?.start().await
    }

    pub async fn pause(&self, session_id: SessionId) -> SimResult<()> {
        self.get(session_id)?.pause().await
    }

    pub async fn resume(&self, session_id: SessionId) -> SimResult<()> {
        self.get(session_id)?.resume().await
    }

    pub async fn stop(&self, session_id: SessionId) -> SimResult<()> {
        self.get(session_id)?.stop().await
    }

    pub async fn set_speed(&self, session_id: SessionId, factor: f64) -> SimResult<()> {
        self.get(session_id)?.set_speed(factor).await
    }

    pub async fn jump(&self, session_id: SessionId, target_ns: Nanos) -> SimResult<()> {
        self.get(session_id)?.jump(target_ns).await
    }

    pub async fn fast_forward(&self, session_id: SessionId, target_ns: Nanos) -> SimResult<()> {
        self.get(session_id)?.fast_forward(target_ns).await
    }

    pub async fn submit_order(&self, session_id: SessionId, req: SubmitRequest) -> SimResult<Order> {
        self.get(session_id)?.submit(req).await
    }

    pub async fn cancel_order(&self, session_id: SessionId, order_id: OrderId) -> SimResult<Order> {
        self.get(session_id)?.cancel(order_id).await
    }

    pub async fn list_orders(
        &self,
        session_id: SessionId,
        status: Option<OrderStatus>,
    ) -> SimResult<Vec<Order>> {
        Ok(self.get(session_id)?.orders(status).await)
    }

    pub async fn apply_dividend(
        &self,
        session_id: SessionId,
        symbol: Symbol,
        amount_per_share: Price,
    ) -> SimResult<()> {
        self.get(session_id)?
            .apply_dividend(symbol, amount_per_share)
            .await
    }

    pub async fn apply_split(
        &self,
        session_id: SessionId,
        symbol: Symbol,
        ratio: Decimal,
    ) -> SimResult<()> {
        self.get(session_id)?.apply_split(symbol, ratio).await
    }

    pub async fn get_account(&self, session_id: SessionId) -> SimResult<Account> {
        Ok(self.get(session_id)?.account().await)
    }

    pub async fn get_performance(&self, session_id: SessionId) -> SimResult<PerformanceSnapshot> {
        let handle = self.get(session_id)?;
        Ok(PerformanceSnapshot {
            account: handle.account().await,
            positions: handle.positions().await,
            events_processed: handle.events_processed(),
            watermark_ns: handle.watermark(),
        })
    }

    pub fn get_watermark(&self, session_id: SessionId) -> SimResult<Nanos> {
        Ok(self.get(session_id)?.watermark())
    }

    pub fn status(&self, session_id: SessionId) -> SimResult<SessionStatus> {
        Ok(self.get(session_id)?.status())
    }

    /// Orderly shutdown: stop the loop (drains the WAL via its own flush
    /// path), drop the subscriber list, then drop the registry entry (spec
    /// §4.8 "set Stopped, drain WAL, close subscribers, free arenas").
    pub async fn destroy(&self, session_id: SessionId) -> SimResult<()> {
        let handle = self.get(session_id)?;
        let _ = handle.stop().await;
        for conn_id in self.fanout.conn_ids_for_session(session_id) {
            self.fanout.unregister(conn_id);
        }
        self.sessions.remove(&session_id);
        tracing::info!(session_id = %session_id, "session destroyed");
        Ok(())
    }

    /// Stops every session (process shutdown path: "drain sessions, stop
    /// workers, flush WALs", spec §4.10/§5).
    pub async fn shutdown(&self) {
        let ids = self.list();
        for id in ids {
            let _ = self.destroy(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WsConfig;
    use std::fs;

    fn test_app_config(data_root: PathBuf, wal_root: PathBuf) -> AppConfig {
        AppConfig {
            data_root,
            wal_root,
            max_sessions: 1,
            ..AppConfig::default()
        }
    }

    fn test_session_config() -> SessionConfig {
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
            fee_table: Default::default(),
            ws: WsConfig::default(),
            checkpoint_interval_events: 1_000_000,
            wal_directory: None,
            event_queue_capacity: 10_000,
            event_queue_overflow_policy: crate::config::OverflowPolicy::DropOldest,
        }
    }

    fn write_aapl_csv(root: &std::path::Path) {
        fs::create_dir_all(root).unwrap();
        fs::write(
            root.join("AAPL.csv"),
            "timestamp_ns,seq,kind,price,size,exchange,conditions\n\
             0,1,trade,150.00,100,1,\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn create_enforces_max_sessions() {
        let dir = std::env::temp_dir().join(format!("broker-sim-sm-test-{}", uuid::Uuid::new_v4()));
        write_aapl_csv(&dir);
        let app_config = test_app_config(dir.clone(), dir.join("wal"));
        let fanout = Arc::new(Fanout::new(&WsConfig::default()));
        let manager = SessionManager::new(app_config, fanout);

        let first = manager.create(test_session_config()).unwrap();
        assert!(manager.get(first).is_ok());

        let err = manager.create(test_session_config()).unwrap_err();
        assert!(matches!(err, SimError::RejectedByPolicy(_)));

        manager.destroy(first).await.unwrap();
        assert!(manager.get(first).is_err());
    }

    #[tokio::test]
    async fn unknown_session_id_is_not_found() {
        let dir = std::env::temp_dir().join(format!("broker-sim-sm-test-{}", uuid::Uuid::new_v4()));
        write_aapl_csv(&dir);
        let app_config = test_app_config(dir.clone(), dir.join("wal"));
        let fanout = Arc::new(Fanout::new(&WsConfig::default()));
        let manager = SessionManager::new(app_config, fanout);

        let err = manager.get(uuid::Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, SimError::NotFound(_)));
    }
}
