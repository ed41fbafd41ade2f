//! Process-wide and per-session configuration.
//!
//! `AppConfig` is loaded once at startup from YAML (grounded on the
//! teacher's `csv_io::load_trading_config` parse-once discipline, swapping
//! CSV for YAML since this is process configuration rather than a market
//! data fixture). `SessionConfig` enumerates every knob of spec §6 and is
//! supplied in full by the `POST /sessions` request body.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Overflow policy for a bounded queue (EventQueue or a subscriber outbox).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::DropOldest
    }
}

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_wal_root")]
    pub wal_root: PathBuf,

    /// Root directory holding per-symbol CSV market data, shared by every
    /// session's `CsvDataSource` (spec §6 "persisted state layout").
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_log_file")]
    pub log_file: String,

    #[serde(default)]
    pub rotation: String,

    #[serde(default)]
    pub use_json: bool,

    #[serde(default = "default_true")]
    pub enable_tracing: bool,

    /// Static bearer token for the control plane. `None` disables the
    /// check entirely (spec §6: "absent token disables the check").
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_sessions() -> usize {
    64
}
fn default_wal_root() -> PathBuf {
    PathBuf::from("./data/wal")
}
fn default_data_root() -> PathBuf {
    PathBuf::from("./data/market")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "./logs".to_string()
}
fn default_log_file() -> String {
    "broker-sim.log".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_sessions: default_max_sessions(),
            wal_root: default_wal_root(),
            data_root: default_data_root(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            rotation: "never".to_string(),
            use_json: false,
            enable_tracing: true,
            auth_token: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

impl AppConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fee schedule (spec §6 "fee table").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeTable {
    pub per_share_commission: rust_decimal::Decimal,
    pub per_order_commission: rust_decimal::Decimal,
    pub sec_fee_per_million: rust_decimal::Decimal,
    pub taf_fee_per_share: rust_decimal::Decimal,
    pub finra_taf_cap: rust_decimal::Decimal,
    pub maker_rebate_per_share: rust_decimal::Decimal,
    pub taker_fee_per_share: rust_decimal::Decimal,
}

impl Default for FeeTable {
    fn default() -> Self {
        use rust_decimal::Decimal;
        Self {
            per_share_commission: Decimal::ZERO,
            per_order_commission: Decimal::ZERO,
            sec_fee_per_million: Decimal::new(278, 2), // $27.80 / $1,000,000 notional (illustrative)
            taf_fee_per_share: Decimal::new(166, 5),   // $0.00166 / share (illustrative)
            finra_taf_cap: Decimal::new(829, 2),       // $8.29 cap per trade (illustrative)
            maker_rebate_per_share: Decimal::ZERO,
            taker_fee_per_share: Decimal::ZERO,
        }
    }
}

/// WebSocket fanout tuning, configured process-wide per spec §6 but kept
/// its own struct so a session can be created with overrides in tests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WsConfig {
    pub queue_size: usize,
    pub overflow_policy: OverflowPolicy,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            overflow_policy: OverflowPolicy::DropOldest,
            batch_size: 100,
            flush_interval_ms: 25,
        }
    }
}

/// Every per-session knob enumerated in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub symbols: Vec<String>,
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,

    #[serde(default = "default_initial_capital")]
    pub initial_capital: rust_decimal::Decimal,

    #[serde(default = "default_speed_factor")]
    pub speed_factor: f64,

    #[serde(default = "default_true")]
    pub enable_latency: bool,
    #[serde(default = "default_true")]
    pub enable_slippage: bool,
    #[serde(default = "default_true")]
    pub enable_market_impact: bool,
    #[serde(default = "default_true")]
    pub enable_partial_fills: bool,
    #[serde(default = "default_true")]
    pub enable_margin_call_checks: bool,
    #[serde(default)]
    pub enable_forced_liquidation: bool,
    #[serde(default = "default_true")]
    pub enable_wal: bool,

    #[serde(default)]
    pub fixed_latency_us: u64,
    #[serde(default)]
    pub random_latency_max_us: u64,

    #[serde(default)]
    pub fixed_slippage_bps: f64,
    #[serde(default)]
    pub random_slippage_max_bps: f64,

    #[serde(default)]
    pub market_impact_bps: f64,
    #[serde(default)]
    pub market_impact_per_share: f64,
    #[serde(default)]
    pub market_impact_sqrt_coef: f64,

    #[serde(default)]
    pub partial_fill_probability: f64,
    #[serde(default)]
    pub rejection_probability: f64,

    #[serde(default)]
    pub allow_shorting: bool,
    #[serde(default)]
    pub max_position_value: Option<rust_decimal::Decimal>,
    #[serde(default)]
    pub max_single_order_value: Option<rust_decimal::Decimal>,

    #[serde(default = "default_maintenance_margin_pct")]
    pub maintenance_margin_pct: rust_decimal::Decimal,

    #[serde(default)]
    pub fee_table: FeeTable,

    #[serde(default)]
    pub ws: WsConfig,

    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_events: u64,

    #[serde(default)]
    pub wal_directory: Option<PathBuf>,

    #[serde(default = "default_queue_capacity")]
    pub event_queue_capacity: usize,
    #[serde(default)]
    pub event_queue_overflow_policy: OverflowPolicy,
}

fn default_initial_capital() -> rust_decimal::Decimal {
    rust_decimal::Decimal::from(100_000)
}
fn default_speed_factor() -> f64 {
    0.0
}
fn default_maintenance_margin_pct() -> rust_decimal::Decimal {
    rust_decimal::Decimal::new(25, 2) // 25%
}
fn default_checkpoint_interval() -> u64 {
    1000
}
fn default_queue_capacity() -> usize {
    10_000
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), crate::errors::SimError> {
        use crate::errors::SimError;
        if self.symbols.is_empty() {
            return Err(SimError::InvalidArgument("symbols must be non-empty".into()));
        }
        if self.end < self.start {
            return Err(SimError::InvalidArgument("end must be >= start".into()));
        }
        if self.speed_factor < 0.0 {
            return Err(SimError::InvalidArgument("speed_factor must be >= 0".into()));
        }
        if self.initial_capital.is_sign_negative() {
            return Err(SimError::InvalidArgument(
                "initial_capital must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_config_default_is_sane() {
        let cfg = AppConfig::default();
        assert!(cfg.max_sessions > 0);
        assert!(cfg.auth_token.is_none());
    }

    #[test]
    fn session_config_rejects_empty_symbols() {
        let cfg = SessionConfig {
            symbols: vec![],
            start: chrono::Utc::now(),
            end: chrono::Utc::now(),
            initial_capital: default_initial_capital(),
            speed_factor: 0.0,
            enable_latency: true,
            enable_slippage: true,
            enable_market_impact: true,
            enable_partial_fills: true,
            enable_margin_call_checks: true,
            enable_forced_liquidation: false,
            enable_wal: true,
            fixed_latency_us: 0,
            random_latency_max_us: 0,
            fixed_slippage_bps: 0.0,
            random_slippage_max_bps: 0.0,
            market_impact_bps: 0.0,
            market_impact_per_share: 0.0,
            market_impact_sqrt_coef: 0.0,
            partial_fill_probability: 0.0,
            rejection_probability: 0.0,
            allow_shorting: false,
            max_position_value: None,
            max_single_order_value: None,
            maintenance_margin_pct: default_maintenance_margin_pct(),
            fee_table: FeeTable::default(),
            ws: WsConfig::default(),
            checkpoint_interval_events: 1000,
            wal_directory: None,
            event_queue_capacity: 10_000,
            event_queue_overflow_policy: OverflowPolicy::DropOldest,
        };
        assert!(cfg.validate().is_err());
    }
}
