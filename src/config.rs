//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! The signing key is referenced by env-var name in the config and
//! resolved at startup into a `SecretString`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::engine::reconciler::ReconcilePolicy;
use crate::gateway::paper::PaperConfig;
use crate::gateway::vertex::{VertexConfig, DEFAULT_CHAIN_ID, DEFAULT_ENGINE_URL, DEFAULT_INDEXER_URL};
use crate::types::{CyclerError, DrawRange, ProductId, TrackedInstruments, DEFAULT_SLIPPAGE};

/// Longest configurable pause or reconcile wait.
const MAX_WAIT_SECS: u64 = 86_400;
/// Longest order time-to-live.
const MAX_ORDER_TTL_SECS: u64 = 7 * 86_400;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub trading: TradingConfig,
    #[serde(default)]
    pub pause: PauseConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub paper: PaperSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccountConfig {
    /// Name of the env var holding the hex private key.
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
    #[serde(default = "default_subaccount_name")]
    pub subaccount_name: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            private_key_env: default_private_key_env(),
            subaccount_name: default_subaccount_name(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    Vertex,
    #[default]
    Paper,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default)]
    pub mode: GatewayMode,
    #[serde(default = "default_engine_url")]
    pub engine_url: String,
    #[serde(default = "default_indexer_url")]
    pub indexer_url: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::default(),
            engine_url: default_engine_url(),
            indexer_url: default_indexer_url(),
            chain_id: default_chain_id(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TradingConfig {
    /// Product ids to cycle. `[0]` selects by reward coefficient.
    pub products: Vec<ProductId>,
    #[serde(default = "default_slippage")]
    pub slippage: Decimal,
    #[serde(default = "default_order_ttl_secs")]
    pub order_ttl_secs: u64,
    /// Percent of max order size to open, drawn per cycle.
    #[serde(default = "default_percent")]
    pub percent: DrawRange,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PauseConfig {
    #[serde(default = "default_before_close")]
    pub before_close: DrawRange,
    #[serde(default = "default_between_trades")]
    pub between_trades: DrawRange,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            before_close: default_before_close(),
            between_trades: default_between_trades(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// 0 retries until shutdown.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            lookback: default_lookback(),
            cooldown_secs: default_cooldown_secs(),
            settle_secs: default_settle_secs(),
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaperSection {
    #[serde(default = "default_initial_health")]
    pub initial_health: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    #[serde(default)]
    pub reject_rate: f64,
    #[serde(default = "default_volatility")]
    pub volatility: f64,
    pub seed: Option<u64>,
}

impl Default for PaperSection {
    fn default() -> Self {
        Self {
            initial_health: default_initial_health(),
            leverage: default_leverage(),
            fee_rate: default_fee_rate(),
            reject_rate: 0.0,
            volatility: default_volatility(),
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_private_key_env() -> String {
    "CYCLER_PRIVATE_KEY".to_string()
}
fn default_subaccount_name() -> String {
    "default".to_string()
}
fn default_engine_url() -> String {
    DEFAULT_ENGINE_URL.to_string()
}
fn default_indexer_url() -> String {
    DEFAULT_INDEXER_URL.to_string()
}
fn default_chain_id() -> u64 {
    DEFAULT_CHAIN_ID
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_slippage() -> Decimal {
    DEFAULT_SLIPPAGE
}
fn default_order_ttl_secs() -> u64 {
    60
}
fn default_percent() -> DrawRange {
    DrawRange::new(70.0, 90.0)
}
fn default_before_close() -> DrawRange {
    DrawRange::new(10.0, 20.0)
}
fn default_between_trades() -> DrawRange {
    DrawRange::new(20.0, 40.0)
}
fn default_lookback() -> usize {
    10
}
fn default_cooldown_secs() -> u64 {
    10
}
fn default_settle_secs() -> u64 {
    5
}
fn default_initial_health() -> Decimal {
    dec!(1000)
}
fn default_leverage() -> Decimal {
    dec!(5)
}
fn default_fee_rate() -> Decimal {
    dec!(0.0002)
}
fn default_volatility() -> f64 {
    0.001
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Check everything that would otherwise fail mid-run.
    ///
    /// Credentials are checked separately by [`AppConfig::private_key`]
    /// since they come from the environment.
    pub fn validate(&self) -> Result<(), CyclerError> {
        self.tracked()?;

        let pct = self.trading.percent;
        if !pct.is_ordered() || pct.from <= 0.0 || pct.to > 100.0 {
            return Err(CyclerError::Config(format!(
                "trading.percent must satisfy 0 < from <= to <= 100, got {pct}"
            )));
        }
        for (name, range) in [
            ("pause.before_close", self.pause.before_close),
            ("pause.between_trades", self.pause.between_trades),
        ] {
            if !range.is_ordered() || range.from < 0.0 || range.to > MAX_WAIT_SECS as f64 {
                return Err(CyclerError::Config(format!(
                    "{name} must satisfy 0 <= from <= to <= {MAX_WAIT_SECS}, got {range}"
                )));
            }
        }
        if self.trading.slippage.is_sign_negative() || self.trading.slippage >= Decimal::ONE {
            return Err(CyclerError::Config(format!(
                "trading.slippage must be in [0, 1), got {}",
                self.trading.slippage
            )));
        }
        if self.trading.order_ttl_secs == 0 || self.trading.order_ttl_secs > MAX_ORDER_TTL_SECS {
            return Err(CyclerError::Config(format!(
                "trading.order_ttl_secs must be in 1..={MAX_ORDER_TTL_SECS}, got {}",
                self.trading.order_ttl_secs
            )));
        }
        for (name, secs) in [
            ("reconcile.cooldown_secs", self.reconcile.cooldown_secs),
            ("reconcile.settle_secs", self.reconcile.settle_secs),
        ] {
            if secs > MAX_WAIT_SECS {
                return Err(CyclerError::Config(format!(
                    "{name} must be at most {MAX_WAIT_SECS}, got {secs}"
                )));
            }
        }
        if self.reconcile.lookback == 0 {
            return Err(CyclerError::Config("reconcile.lookback must be positive".into()));
        }
        if self.gateway.mode == GatewayMode::Paper {
            let p = &self.paper;
            if p.initial_health.is_sign_negative() || p.leverage <= Decimal::ZERO {
                return Err(CyclerError::Config(
                    "paper.initial_health must be >= 0 and paper.leverage > 0".into(),
                ));
            }
            if !(0.0..=1.0).contains(&p.reject_rate) {
                return Err(CyclerError::Config(format!(
                    "paper.reject_rate must be in [0, 1], got {}",
                    p.reject_rate
                )));
            }
        }
        Ok(())
    }

    pub fn tracked(&self) -> Result<TrackedInstruments, CyclerError> {
        TrackedInstruments::from_products(&self.trading.products)
    }

    /// Signing key for vertex mode.
    pub fn private_key(&self) -> Result<SecretString, CyclerError> {
        let env = &self.account.private_key_env;
        match Self::resolve_env(env) {
            Ok(key) if !key.trim().is_empty() => Ok(SecretString::new(key.trim().to_string())),
            _ => Err(CyclerError::Config(format!(
                "private key env var {env} is not set"
            ))),
        }
    }

    pub fn order_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.trading.order_ttl_secs as i64)
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        let r = &self.reconcile;
        ReconcilePolicy {
            lookback: r.lookback,
            cooldown: Duration::from_secs(r.cooldown_secs),
            settle: Duration::from_secs(r.settle_secs),
            max_attempts: (r.max_attempts > 0).then_some(r.max_attempts),
            slippage: self.trading.slippage,
            order_ttl: self.order_ttl(),
        }
    }

    pub fn vertex_config(&self) -> VertexConfig {
        VertexConfig {
            engine_url: self.gateway.engine_url.clone(),
            indexer_url: self.gateway.indexer_url.clone(),
            chain_id: self.gateway.chain_id,
            subaccount_name: self.account.subaccount_name.clone(),
            request_timeout: Duration::from_secs(self.gateway.request_timeout_secs),
        }
    }

    pub fn paper_config(&self) -> PaperConfig {
        let p = &self.paper;
        PaperConfig {
            initial_health: p.initial_health,
            leverage: p.leverage,
            fee_rate: p.fee_rate,
            reject_rate: p.reject_rate,
            volatility: p.volatility,
            seed: p.seed,
        }
    }
}
