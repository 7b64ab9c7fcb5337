//! Paper-trading venue.
//!
//! An in-memory perp exchange used for dry runs: prices random-walk on
//! every quote, orders fill at the current price when their limit allows,
//! fees and mark-to-market P&L move the account health, and every fill is
//! recorded with its post-trade base balance so reconciliation sees the
//! same history shape as on a live venue.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::ExchangeGateway;
use crate::types::{Fill, Instrument, OrderIntent, OrderResult, ProductId, RewardCoefficient, Side};

const GATEWAY_NAME: &str = "paper";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Starting quote collateral.
    pub initial_health: Decimal,
    /// Notional allowed per unit of initial health.
    pub leverage: Decimal,
    /// Taker fee as a fraction of notional.
    pub fee_rate: Decimal,
    /// Probability (0–1) that a submission is rejected outright.
    pub reject_rate: f64,
    /// Max fractional price move per quote.
    pub volatility: f64,
    pub seed: Option<u64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_health: dec!(1000),
            leverage: dec!(5),
            fee_rate: dec!(0.0002),
            reject_rate: 0.0,
            volatility: 0.001,
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Venue state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PaperMarket {
    instrument: Instrument,
    price: Decimal,
    /// Signed raw base position.
    position: Decimal,
    /// Oldest first.
    fills: Vec<Fill>,
    reward_coefficient: Decimal,
}

impl PaperMarket {
    fn notional(&self) -> Decimal {
        self.instrument.to_human(self.position) * self.price
    }
}

#[derive(Debug)]
struct PaperState {
    quote_balance: Decimal,
    markets: BTreeMap<ProductId, PaperMarket>,
    rng: StdRng,
    submissions: u64,
}

impl PaperState {
    /// Equity minus initial margin on open notional.
    fn initial_health(&self, leverage: Decimal) -> Decimal {
        let mut equity = self.quote_balance;
        let mut margin = Decimal::ZERO;
        for m in self.markets.values() {
            equity += m.notional();
            margin += m.notional().abs() / leverage;
        }
        equity - margin
    }
}

/// In-memory simulated perp venue.
pub struct PaperGateway {
    config: PaperConfig,
    state: Mutex<PaperState>,
    nonce: AtomicU64,
}

impl PaperGateway {
    /// Venue listing BTC-PERP (#2) and ETH-PERP (#4).
    pub fn new(config: PaperConfig) -> Self {
        Self::with_instruments(config, default_listings())
    }

    /// Venue listing the given instruments at the given starting prices.
    pub fn with_instruments(config: PaperConfig, listings: Vec<(Instrument, Decimal)>) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let markets = listings
            .into_iter()
            .map(|(instrument, price)| {
                let reward_coefficient =
                    Decimal::from_f64(rng.gen_range(0.0..1.0)).unwrap_or_default().round_dp(4);
                (
                    instrument.product_id,
                    PaperMarket {
                        instrument,
                        price,
                        position: Decimal::ZERO,
                        fills: Vec::new(),
                        reward_coefficient,
                    },
                )
            })
            .collect();

        info!(
            health = %config.initial_health,
            leverage = %config.leverage,
            reject_rate = config.reject_rate,
            "Paper venue opened"
        );

        Self {
            state: Mutex::new(PaperState {
                quote_balance: config.initial_health,
                markets,
                rng,
                submissions: 0,
            }),
            nonce: AtomicU64::new(Utc::now().timestamp_millis() as u64),
            config,
        }
    }

    /// Force a raw base position onto the account, as if a close had been
    /// lost. Records a matching fill.
    pub async fn inject_position(&self, product_id: ProductId, raw: Decimal) -> Result<()> {
        let mut state = self.state.lock().await;
        state.submissions += 1;
        let idx = state.submissions;
        let market = state
            .markets
            .get_mut(&product_id)
            .ok_or_else(|| anyhow::anyhow!("Paper venue has no product {product_id}"))?;
        market.position += raw;
        let post = market.position;
        market.fills.push(Fill {
            post_base_balance: post,
            digest: Some(format!("paper-{}", uuid::Uuid::new_v4())),
            submission_idx: Some(idx),
        });
        Ok(())
    }

    /// Current raw position for a product.
    pub async fn position(&self, product_id: ProductId) -> Decimal {
        let state = self.state.lock().await;
        state
            .markets
            .get(&product_id)
            .map(|m| m.position)
            .unwrap_or_default()
    }

    /// Orders submitted so far, accepted or not.
    pub async fn submissions(&self) -> u64 {
        self.state.lock().await.submissions
    }
}

fn default_listings() -> Vec<(Instrument, Decimal)> {
    vec![
        (
            Instrument {
                product_id: 2,
                name: "BTC-PERP".to_string(),
                decimals: 18,
                digits: 3,
                min_size: dec!(1000000000000000),
                size_increment: dec!(1000000000000000),
            },
            dec!(60000),
        ),
        (
            Instrument {
                product_id: 4,
                name: "ETH-PERP".to_string(),
                decimals: 18,
                digits: 2,
                min_size: dec!(10000000000000000),
                size_increment: dec!(10000000000000000),
            },
            dec!(3000),
        ),
    ]
}

// ---------------------------------------------------------------------------
// ExchangeGateway trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn account_health(&self) -> Result<Decimal> {
        let state = self.state.lock().await;
        Ok(state.initial_health(self.config.leverage).round_dp(6))
    }

    /// Random-walks the price by up to `volatility` before quoting it.
    async fn mark_price(&self, product_id: ProductId) -> Result<Decimal> {
        let mut state = self.state.lock().await;
        let vol = self.config.volatility;
        let shock = if vol > 0.0 {
            state.rng.gen_range(-vol..=vol)
        } else {
            0.0
        };
        let market = state
            .markets
            .get_mut(&product_id)
            .ok_or_else(|| anyhow::anyhow!("Paper venue has no product {product_id}"))?;
        let factor = Decimal::ONE + Decimal::from_f64(shock).unwrap_or_default();
        market.price = (market.price * factor).round_dp(2);
        Ok(market.price)
    }

    async fn max_order_size(&self, product_id: ProductId, side: Side, price: Decimal) -> Result<Decimal> {
        let state = self.state.lock().await;
        let health = state.initial_health(self.config.leverage).max(Decimal::ZERO);
        let market = state
            .markets
            .get(&product_id)
            .ok_or_else(|| anyhow::anyhow!("Paper venue has no product {product_id}"))?;
        if price <= Decimal::ZERO {
            anyhow::bail!("Price must be positive, got {price}");
        }

        let mut human = health * self.config.leverage / price;
        // Reducing an existing position frees its size on top.
        if Side::of_amount(market.position) != side && !market.position.is_zero() {
            human += market.instrument.to_human(market.position).abs();
        }
        Ok(market.instrument.truncate_raw(market.instrument.to_raw(human)))
    }

    async fn instrument(&self, product_id: ProductId) -> Result<Instrument> {
        let state = self.state.lock().await;
        state
            .markets
            .get(&product_id)
            .map(|m| m.instrument.clone())
            .ok_or_else(|| anyhow::anyhow!("Paper venue has no product {product_id}"))
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        let state = self.state.lock().await;
        Ok(state.markets.values().map(|m| m.instrument.clone()).collect())
    }

    async fn reward_coefficients(&self) -> Result<Vec<RewardCoefficient>> {
        let state = self.state.lock().await;
        Ok(state
            .markets
            .values()
            .map(|m| RewardCoefficient {
                product_id: m.instrument.product_id,
                coefficient: m.reward_coefficient,
            })
            .collect())
    }

    async fn recent_fills(&self, product_id: ProductId, limit: usize) -> Result<Vec<Fill>> {
        let state = self.state.lock().await;
        let market = state
            .markets
            .get(&product_id)
            .ok_or_else(|| anyhow::anyhow!("Paper venue has no product {product_id}"))?;
        Ok(market.fills.iter().rev().take(limit).cloned().collect())
    }

    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderResult> {
        let mut state = self.state.lock().await;
        state.submissions += 1;
        let idx = state.submissions;

        if intent.expiration <= Utc::now() {
            return Ok(OrderResult::rejected("order expired", serde_json::Value::Null));
        }
        if self.config.reject_rate > 0.0 && state.rng.gen_bool(self.config.reject_rate.min(1.0)) {
            return Ok(OrderResult::rejected("simulated rejection", serde_json::Value::Null));
        }

        let fee_rate = self.config.fee_rate;
        let market = state
            .markets
            .get_mut(&intent.product_id)
            .ok_or_else(|| anyhow::anyhow!("Paper venue has no product {}", intent.product_id))?;

        let price = market.price;
        let crosses = match intent.side() {
            Side::Long => intent.limit_price >= price,
            Side::Short => intent.limit_price <= price,
        };
        if !crosses {
            return Ok(OrderResult::rejected(
                format!("limit {} does not cross market {price}", intent.limit_price),
                serde_json::Value::Null,
            ));
        }

        let human = market.instrument.to_human(intent.amount);
        let notional = human * price;
        let fee = notional.abs() * fee_rate;

        market.position += intent.amount;
        let post = market.position;
        let digest = format!("paper-{}", uuid::Uuid::new_v4());
        market.fills.push(Fill {
            post_base_balance: post,
            digest: Some(digest.clone()),
            submission_idx: Some(idx),
        });
        state.quote_balance -= notional + fee;

        debug!(
            product_id = intent.product_id,
            amount = %human,
            price = %price,
            fee = %fee,
            post_balance = %post,
            "Paper fill"
        );

        Ok(OrderResult::success(serde_json::json!({
            "status": "success",
            "data": { "digest": digest, "fill_price": price.to_string() },
        })))
    }

    fn order_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::Relaxed)
    }

    fn name(&self) -> &'static str {
        GATEWAY_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
