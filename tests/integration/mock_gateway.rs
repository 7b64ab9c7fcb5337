//! Mock exchange gateway for integration testing.
//!
//! Provides a deterministic `ExchangeGateway` implementation that keeps
//! positions and fill history in memory, with scripted health readings,
//! scripted order rejections and an optional fill-history lag.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use cycler::engine::timing::{Randomizer, ShutdownTrigger};
use cycler::gateway::ExchangeGateway;
use cycler::types::*;

pub const ONE: Decimal = dec!(1000000000000000000);

pub fn btc() -> Instrument {
    Instrument {
        product_id: 2,
        name: "BTC-PERP".to_string(),
        decimals: 18,
        digits: 3,
        min_size: dec!(1000000000000000),
        size_increment: dec!(1000000000000000),
    }
}

pub fn eth() -> Instrument {
    Instrument {
        product_id: 4,
        name: "ETH-PERP".to_string(),
        decimals: 18,
        digits: 2,
        min_size: dec!(10000000000000000),
        size_increment: dec!(10000000000000000),
    }
}

/// A mock exchange for deterministic testing.
///
/// All state is in-memory and controllable from test code.
pub struct MockGateway {
    instruments: Vec<Instrument>,
    /// Health readings, replayed in order; the last one repeats.
    health: Arc<Mutex<VecDeque<Decimal>>>,
    prices: Arc<Mutex<HashMap<ProductId, Decimal>>>,
    max_sizes: Arc<Mutex<HashMap<ProductId, Decimal>>>,
    coefficients: Arc<Mutex<Vec<RewardCoefficient>>>,
    positions: Arc<Mutex<HashMap<ProductId, Decimal>>>,
    /// Most recent first, each with the instant it becomes visible.
    fills: Arc<Mutex<HashMap<ProductId, Vec<(Instant, Fill)>>>>,
    /// Delay before an accepted order shows up in fill history.
    fill_lag: Arc<Mutex<Duration>>,
    submissions: Arc<Mutex<Vec<OrderIntent>>>,
    /// Submission indices (0-based) to reject.
    rejections: Arc<Mutex<Vec<usize>>>,
    reject_all: Arc<Mutex<bool>>,
    /// Fires shutdown once this many orders have been submitted.
    shutdown_after: Arc<Mutex<Option<(usize, ShutdownTrigger)>>>,
    nonce: AtomicU64,
}

impl MockGateway {
    /// BTC and ETH listed at 60000 and 3000, 1 BTC / 10 ETH max size.
    pub fn new(health: &[Decimal]) -> Self {
        let prices = HashMap::from([(2, dec!(60000)), (4, dec!(3000))]);
        let max_sizes = HashMap::from([(2, ONE), (4, ONE * dec!(10))]);
        Self {
            instruments: vec![btc(), eth()],
            health: Arc::new(Mutex::new(health.iter().copied().collect())),
            prices: Arc::new(Mutex::new(prices)),
            max_sizes: Arc::new(Mutex::new(max_sizes)),
            coefficients: Arc::new(Mutex::new(Vec::new())),
            positions: Arc::new(Mutex::new(HashMap::new())),
            fills: Arc::new(Mutex::new(HashMap::new())),
            fill_lag: Arc::new(Mutex::new(Duration::ZERO)),
            submissions: Arc::new(Mutex::new(Vec::new())),
            rejections: Arc::new(Mutex::new(Vec::new())),
            reject_all: Arc::new(Mutex::new(false)),
            shutdown_after: Arc::new(Mutex::new(None)),
            nonce: AtomicU64::new(1),
        }
    }

    /// Override a listed instrument's minimum order size.
    pub fn with_min_size(mut self, product_id: ProductId, raw: Decimal) -> Self {
        for instrument in self.instruments.iter_mut().filter(|i| i.product_id == product_id) {
            instrument.min_size = raw;
        }
        self
    }

    pub fn set_max_size(&self, product_id: ProductId, raw: Decimal) {
        self.max_sizes.lock().unwrap().insert(product_id, raw);
    }

    pub fn set_coefficients(&self, coefficients: Vec<RewardCoefficient>) {
        *self.coefficients.lock().unwrap() = coefficients;
    }

    /// Reject the submission with this 0-based index.
    pub fn reject_submission(&self, index: usize) {
        self.rejections.lock().unwrap().push(index);
    }

    pub fn reject_everything(&self) {
        *self.reject_all.lock().unwrap() = true;
    }

    /// Accepted orders appear in fill history only after `lag`, as with
    /// an indexer trailing the matching engine.
    pub fn lag_fills(&self, lag: Duration) {
        *self.fill_lag.lock().unwrap() = lag;
    }

    pub fn shutdown_after_submissions(&self, count: usize, trigger: ShutdownTrigger) {
        *self.shutdown_after.lock().unwrap() = Some((count, trigger));
    }

    /// Leave a position behind as a crashed run would.
    pub fn leave_position(&self, product_id: ProductId, raw: Decimal) {
        self.apply_fill(product_id, raw, Instant::now());
    }

    pub fn position(&self, product_id: ProductId) -> Decimal {
        self.positions
            .lock()
            .unwrap()
            .get(&product_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<OrderIntent> {
        self.submissions.lock().unwrap().clone()
    }

    fn apply_fill(&self, product_id: ProductId, amount: Decimal, visible_at: Instant) {
        let mut positions = self.positions.lock().unwrap();
        let position = positions.entry(product_id).or_default();
        *position += amount;
        let post = *position;

        self.fills
            .lock()
            .unwrap()
            .entry(product_id)
            .or_default()
            .insert(0, (visible_at, Fill::with_balance(post)));
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn account_health(&self) -> Result<Decimal> {
        let mut health = self.health.lock().unwrap();
        let reading = if health.len() > 1 {
            health.pop_front()
        } else {
            health.front().copied()
        };
        reading.ok_or_else(|| anyhow!("No health reading scripted"))
    }

    async fn mark_price(&self, product_id: ProductId) -> Result<Decimal> {
        self.prices
            .lock()
            .unwrap()
            .get(&product_id)
            .copied()
            .ok_or_else(|| anyhow!("No price for product {product_id}"))
    }

    async fn max_order_size(&self, product_id: ProductId, _side: Side, _price: Decimal) -> Result<Decimal> {
        self.max_sizes
            .lock()
            .unwrap()
            .get(&product_id)
            .copied()
            .ok_or_else(|| anyhow!("No max size for product {product_id}"))
    }

    async fn instrument(&self, product_id: ProductId) -> Result<Instrument> {
        self.instruments
            .iter()
            .find(|i| i.product_id == product_id)
            .cloned()
            .ok_or_else(|| anyhow!("Product not found: {product_id}"))
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        Ok(self.instruments.clone())
    }

    async fn reward_coefficients(&self) -> Result<Vec<RewardCoefficient>> {
        Ok(self.coefficients.lock().unwrap().clone())
    }

    async fn recent_fills(&self, product_id: ProductId, limit: usize) -> Result<Vec<Fill>> {
        let now = Instant::now();
        Ok(self
            .fills
            .lock()
            .unwrap()
            .get(&product_id)
            .map(|f| {
                f.iter()
                    .filter(|(visible_at, _)| *visible_at <= now)
                    .take(limit)
                    .map(|(_, fill)| fill.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderResult> {
        let index = {
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push(intent.clone());
            submissions.len() - 1
        };

        let rejected =
            *self.reject_all.lock().unwrap() || self.rejections.lock().unwrap().contains(&index);

        if !rejected {
            let lag = *self.fill_lag.lock().unwrap();
            self.apply_fill(intent.product_id, intent.amount, Instant::now() + lag);
        }

        if let Some((count, trigger)) = self.shutdown_after.lock().unwrap().as_ref() {
            if index + 1 >= *count {
                trigger.trigger();
            }
        }

        if rejected {
            Ok(OrderResult::rejected("mock rejection", serde_json::Value::Null))
        } else {
            Ok(OrderResult::success(serde_json::json!({ "status": "success" })))
        }
    }

    fn order_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// Scripted randomness
// ---------------------------------------------------------------------------

/// Replays fixed draws. Uniform draws are clamped into the requested
/// range, so a single list can serve percent and pause draws alike.
pub struct FixedDraws {
    uniforms: Vec<f64>,
    coins: Vec<bool>,
    cursor: (usize, usize),
}

impl FixedDraws {
    pub fn new(uniforms: &[f64], coins: &[bool]) -> Self {
        Self {
            uniforms: uniforms.to_vec(),
            coins: coins.to_vec(),
            cursor: (0, 0),
        }
    }
}

impl Randomizer for FixedDraws {
    fn uniform(&mut self, min: f64, max: f64) -> f64 {
        if self.uniforms.is_empty() {
            return min;
        }
        let v = self.uniforms[self.cursor.0 % self.uniforms.len()];
        self.cursor.0 += 1;
        v.clamp(min, max.max(min))
    }

    /// Always the first candidate.
    fn index(&mut self, _len: usize) -> usize {
        0
    }

    fn coin(&mut self) -> bool {
        if self.coins.is_empty() {
            return true;
        }
        let v = self.coins[self.cursor.1 % self.coins.len()];
        self.cursor.1 += 1;
        v
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_health_script_repeats_last() {
        let gw = MockGateway::new(&[dec!(100), dec!(50)]);
        assert_eq!(gw.account_health().await.unwrap(), dec!(100));
        assert_eq!(gw.account_health().await.unwrap(), dec!(50));
        assert_eq!(gw.account_health().await.unwrap(), dec!(50));
    }

    #[tokio::test]
    async fn test_mock_fill_tracks_post_balance() {
        let gw = MockGateway::new(&[dec!(100)]);
        let intent = OrderIntent::new(2, dec!(5), dec!(60000), dec!(0.005), chrono::Duration::seconds(60), 1);
        let result = tokio_test::assert_ok!(gw.submit_order(&intent).await);
        assert!(result.is_success());

        let fills = gw.recent_fills(2, 10).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].post_base_balance, dec!(5));
        assert_eq!(gw.position(2), dec!(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_lagged_fill_appears_later() {
        let gw = MockGateway::new(&[dec!(100)]);
        gw.lag_fills(Duration::from_secs(3));
        let intent = OrderIntent::new(2, dec!(5), dec!(60000), dec!(0.005), chrono::Duration::seconds(60), 1);
        gw.submit_order(&intent).await.unwrap();

        assert_eq!(gw.position(2), dec!(5));
        assert!(gw.recent_fills(2, 10).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(gw.recent_fills(2, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_rejection_leaves_position() {
        let gw = MockGateway::new(&[dec!(100)]);
        gw.reject_submission(0);
        let intent = OrderIntent::new(2, dec!(5), dec!(60000), dec!(0.005), chrono::Duration::seconds(60), 1);
        let result = gw.submit_order(&intent).await.unwrap();
        assert_eq!(result.status, OrderStatus::Rejected);
        assert!(gw.position(2).is_zero());
        assert!(gw.recent_fills(2, 10).await.unwrap().is_empty());
    }
}
