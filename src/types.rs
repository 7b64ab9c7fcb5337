//! Shared types for the CYCLER engine.
//!
//! These types form the data model used across the gateway, selector,
//! reconciler and controller. Amounts are carried in the exchange's raw
//! fixed-point units (`Decimal` integers) unless a name says otherwise.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Exchange product identifier.
pub type ProductId = u32;

/// Configured product id that switches instrument selection to
/// reward-coefficient best-pick mode.
pub const AUTO_SELECT_SENTINEL: ProductId = 0;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Direction implied by a signed amount. Zero counts as long.
    pub fn of_amount(amount: Decimal) -> Self {
        if amount.is_sign_negative() && !amount.is_zero() {
            Side::Short
        } else {
            Side::Long
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pricing helpers
// ---------------------------------------------------------------------------

/// Round a price to a whole number of quote units, half away from zero.
pub fn integer_price(price: Decimal) -> Decimal {
    price.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// Push `price` against ourselves by `slippage` in the direction of the
/// trade (buys pay up, sells accept less) and round to an integer price.
pub fn slippage_price(price: Decimal, side: Side, slippage: Decimal) -> Decimal {
    let multiplier = match side {
        Side::Long => Decimal::ONE + slippage,
        Side::Short => Decimal::ONE - slippage,
    };
    integer_price(price * multiplier)
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// A tradable perpetual market. Loaded once from gateway metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub product_id: ProductId,
    pub name: String,
    /// Raw-unit precision: `human = raw / 10^decimals`.
    pub decimals: u32,
    /// Digits kept when rounding a human-readable size.
    pub digits: u32,
    /// Minimum order size in raw units.
    pub min_size: Decimal,
    /// Size increment in raw units.
    pub size_increment: Decimal,
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.product_id)
    }
}

impl Instrument {
    /// `10^decimals` as a Decimal.
    pub fn scale(&self) -> Decimal {
        Decimal::from_i128_with_scale(10i128.pow(self.decimals), 0)
    }

    /// Raw amount → human size, truncated toward zero to `digits`.
    pub fn to_human(&self, raw: Decimal) -> Decimal {
        (raw / self.scale()).round_dp_with_strategy(self.digits, RoundingStrategy::ToZero)
    }

    /// Human size → raw amount.
    pub fn to_raw(&self, human: Decimal) -> Decimal {
        human * self.scale()
    }

    /// Snap a raw amount onto the instrument's display grid (toward zero).
    pub fn truncate_raw(&self, raw: Decimal) -> Decimal {
        self.to_raw(self.to_human(raw))
    }

    #[cfg(test)]
    pub fn sample_btc() -> Self {
        Instrument {
            product_id: 2,
            name: "BTC-PERP".to_string(),
            decimals: 18,
            digits: 3,
            min_size: dec!(1000000000000000),
            size_increment: dec!(1000000000000000),
        }
    }

    #[cfg(test)]
    pub fn sample_eth() -> Self {
        Instrument {
            product_id: 4,
            name: "ETH-PERP".to_string(),
            decimals: 18,
            digits: 2,
            min_size: dec!(10000000000000000),
            size_increment: dec!(10000000000000000),
        }
    }
}

/// Immutable lookup of instruments by product id.
#[derive(Debug, Clone, Default)]
pub struct InstrumentBook {
    by_id: BTreeMap<ProductId, Instrument>,
}

impl InstrumentBook {
    pub fn new(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        Self {
            by_id: instruments
                .into_iter()
                .map(|i| (i.product_id, i))
                .collect(),
        }
    }

    pub fn get(&self, product_id: ProductId) -> Result<&Instrument, CyclerError> {
        self.by_id
            .get(&product_id)
            .ok_or(CyclerError::UnknownInstrument(product_id))
    }

    pub fn contains(&self, product_id: ProductId) -> bool {
        self.by_id.contains_key(&product_id)
    }

    /// Product ids in ascending order.
    pub fn ids(&self) -> Vec<ProductId> {
        self.by_id.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// The set of products a run operates over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedInstruments {
    Fixed(Vec<ProductId>),
    /// Pick the highest reward coefficient every cycle.
    Auto,
}

impl TrackedInstruments {
    /// Parse the configured product list. `[0]` means auto-select.
    pub fn from_products(products: &[ProductId]) -> Result<Self, CyclerError> {
        match products {
            [] => Err(CyclerError::Config(
                "trading.products must list at least one product id".into(),
            )),
            [AUTO_SELECT_SENTINEL] => Ok(TrackedInstruments::Auto),
            ids if ids.contains(&AUTO_SELECT_SENTINEL) => Err(CyclerError::Config(format!(
                "product id {AUTO_SELECT_SENTINEL} (auto) cannot be combined with other ids: {ids:?}"
            ))),
            ids => {
                let mut unique = Vec::with_capacity(ids.len());
                for id in ids {
                    if !unique.contains(id) {
                        unique.push(*id);
                    }
                }
                Ok(TrackedInstruments::Fixed(unique))
            }
        }
    }

    /// Products that must be flat before a cycle may open. In auto mode
    /// every instrument in the book is a candidate, so all are checked.
    pub fn reconcile_set(&self, book: &InstrumentBook) -> Vec<ProductId> {
        match self {
            TrackedInstruments::Fixed(ids) => ids.clone(),
            TrackedInstruments::Auto => book.ids(),
        }
    }
}

impl fmt::Display for TrackedInstruments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackedInstruments::Auto => write!(f, "auto"),
            TrackedInstruments::Fixed(ids) => {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                write!(f, "[{}]", ids.join(", "))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Draw ranges
// ---------------------------------------------------------------------------

/// Inclusive `{ from, to }` range used for percent and pause draws.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawRange {
    pub from: f64,
    pub to: f64,
}

impl DrawRange {
    pub const fn new(from: f64, to: f64) -> Self {
        Self { from, to }
    }

    pub fn is_ordered(&self) -> bool {
        self.from.is_finite() && self.to.is_finite() && self.from <= self.to
    }
}

impl fmt::Display for DrawRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

// ---------------------------------------------------------------------------
// Orders & fills
// ---------------------------------------------------------------------------

/// A single order submission. Built fresh for every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub product_id: ProductId,
    /// Signed raw amount; the sign is the side.
    pub amount: Decimal,
    pub reference_price: Decimal,
    pub limit_price: Decimal,
    pub expiration: DateTime<Utc>,
    pub nonce: u64,
}

impl OrderIntent {
    pub fn new(
        product_id: ProductId,
        amount: Decimal,
        reference_price: Decimal,
        slippage: Decimal,
        ttl: chrono::Duration,
        nonce: u64,
    ) -> Self {
        let limit_price = slippage_price(reference_price, Side::of_amount(amount), slippage);
        Self {
            product_id,
            amount,
            reference_price,
            limit_price,
            expiration: Utc::now() + ttl,
            nonce,
        }
    }

    pub fn side(&self) -> Side {
        Side::of_amount(self.amount)
    }
}

impl fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} @ {} (ref {}, nonce {})",
            self.product_id,
            self.side(),
            self.amount.abs(),
            self.limit_price,
            self.reference_price,
            self.nonce,
        )
    }
}

/// Gateway verdict for a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Success,
    Rejected,
    Error,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Success => write!(f, "success"),
            OrderStatus::Rejected => write!(f, "rejected"),
            OrderStatus::Error => write!(f, "error"),
        }
    }
}

/// Result of an order submission. Consumed immediately, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub status: OrderStatus,
    /// Human-readable reason for non-success outcomes.
    pub message: String,
    /// Raw gateway response (preserved for the audit log).
    pub raw: serde_json::Value,
}

impl OrderResult {
    pub fn success(raw: serde_json::Value) -> Self {
        Self {
            status: OrderStatus::Success,
            message: String::new(),
            raw,
        }
    }

    pub fn rejected(message: impl Into<String>, raw: serde_json::Value) -> Self {
        Self {
            status: OrderStatus::Rejected,
            message: message.into(),
            raw,
        }
    }

    /// A transport/gateway failure folded into a status.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            status: OrderStatus::Error,
            message: format!("{err:#}"),
            raw: serde_json::Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OrderStatus::Success
    }
}

/// A fill from the account's match history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Base-asset balance of the account right after this fill (raw).
    pub post_base_balance: Decimal,
    pub digest: Option<String>,
    pub submission_idx: Option<u64>,
}

impl Fill {
    pub fn with_balance(post_base_balance: Decimal) -> Self {
        Self {
            post_base_balance,
            digest: None,
            submission_idx: None,
        }
    }
}

/// Per-product incentive weighting (auto-select mode only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardCoefficient {
    pub product_id: ProductId,
    pub coefficient: Decimal,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain outcomes the engine branches on.
#[derive(Debug, thiserror::Error)]
pub enum CyclerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gateway error ({gateway}): {message}")]
    Gateway { gateway: String, message: String },

    #[error("Unsafe residual position on product {product_id}: {residual} raw units still open after {attempts} close attempts")]
    UnsafeResidual {
        product_id: ProductId,
        residual: Decimal,
        attempts: u32,
    },

    #[error("Unknown instrument: product {0}")]
    UnknownInstrument(ProductId),

    #[error("Interrupted by shutdown")]
    Interrupted,
}

/// Default slippage buffer applied to reference prices (0.5%).
pub const DEFAULT_SLIPPAGE: Decimal = dec!(0.005);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
