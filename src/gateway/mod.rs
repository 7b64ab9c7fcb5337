//! Exchange gateway integrations.
//!
//! Defines the `ExchangeGateway` trait and provides implementations for:
//! - Vertex (Arbitrum perps): live execution with EIP-712 signed orders
//! - Paper: in-memory simulated venue for dry runs

pub mod paper;
pub mod vertex;

use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rust_decimal::Decimal;

use crate::types::{Fill, Instrument, OrderIntent, OrderResult, ProductId, RewardCoefficient, Side};

/// Abstraction over the exchange account the engine cycles positions on.
///
/// The gateway is bound to a single account, holds the authoritative
/// position state, and is re-queried for every decision.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Account health metric used as the balance gate (quote units).
    async fn account_health(&self) -> Result<Decimal>;

    /// Current reference price for a product (quote units per base unit).
    async fn mark_price(&self, product_id: ProductId) -> Result<Decimal>;

    /// Largest order the account may place at `price` in `side` (raw units).
    async fn max_order_size(&self, product_id: ProductId, side: Side, price: Decimal) -> Result<Decimal>;

    /// Metadata for a single product.
    async fn instrument(&self, product_id: ProductId) -> Result<Instrument>;

    /// Metadata for every tradable perp product.
    async fn list_instruments(&self) -> Result<Vec<Instrument>>;

    /// Current-epoch reward coefficients, in the gateway's order.
    async fn reward_coefficients(&self) -> Result<Vec<RewardCoefficient>>;

    /// Most recent fills for a product, most recent first.
    async fn recent_fills(&self, product_id: ProductId, limit: usize) -> Result<Vec<Fill>>;

    /// Submit an order. Exchange-side rejections come back as a
    /// non-success `OrderResult`; transport failures as `Err`.
    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderResult>;

    /// Fresh order nonce for this account.
    fn order_nonce(&self) -> u64;

    /// Gateway name for logging.
    fn name(&self) -> &'static str;
}
