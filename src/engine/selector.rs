//! Instrument selection and order sizing.
//!
//! Picks which perp to cycle and sizes the open as a random percentage of
//! the largest order the account can currently afford.

use anyhow::{anyhow, Context, Result};
use rust_decimal::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::timing::{pick_one, Randomizer};
use crate::gateway::ExchangeGateway;
use crate::types::{
    integer_price, slippage_price, DrawRange, Instrument, InstrumentBook, ProductId, Side,
    TrackedInstruments,
};

/// Sized open order, before the minimum-size check.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSize {
    /// Signed raw amount, truncated to the instrument's display digits.
    pub raw_amount: Decimal,
    /// Max order size reported by the gateway (raw, unsigned).
    pub max_size: Decimal,
    pub min_size: Decimal,
    /// Fraction of `max_size` drawn, e.g. `0.8`.
    pub pct: Decimal,
}

impl OrderSize {
    /// Whether the amount clears the instrument minimum.
    pub fn is_placeable(&self) -> bool {
        !self.raw_amount.is_zero() && self.raw_amount.abs() >= self.min_size.abs()
    }
}

pub struct Selector {
    gateway: Arc<dyn ExchangeGateway>,
    slippage: Decimal,
    percent: DrawRange,
}

impl Selector {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, slippage: Decimal, percent: DrawRange) -> Self {
        Self {
            gateway,
            slippage,
            percent,
        }
    }

    /// Choose the product for this cycle.
    ///
    /// Auto mode takes the highest reward coefficient (first listed wins a
    /// tie) among instruments in the book. Fixed mode picks uniformly.
    pub async fn select_instrument(
        &self,
        tracked: &TrackedInstruments,
        book: &InstrumentBook,
        rng: &mut dyn Randomizer,
    ) -> Result<ProductId> {
        match tracked {
            TrackedInstruments::Fixed(ids) => pick_one(rng, ids)
                .copied()
                .ok_or_else(|| anyhow!("No instruments configured")),
            TrackedInstruments::Auto => {
                let mut coefficients = self
                    .gateway
                    .reward_coefficients()
                    .await
                    .context("Failed to fetch reward coefficients")?;

                for c in &coefficients {
                    info!(
                        product_id = c.product_id,
                        coefficient = %c.coefficient,
                        "Reward coefficient"
                    );
                }

                // Stable: equal coefficients keep gateway order.
                coefficients.sort_by(|a, b| b.coefficient.cmp(&a.coefficient));

                coefficients
                    .iter()
                    .map(|c| c.product_id)
                    .find(|id| book.contains(*id))
                    .ok_or_else(|| anyhow!("No reward coefficient matches a known instrument"))
            }
        }
    }

    /// Size an open on `instrument` in `side` at `reference_price`.
    pub async fn compute_order_size(
        &self,
        instrument: &Instrument,
        side: Side,
        reference_price: Decimal,
        rng: &mut dyn Randomizer,
    ) -> Result<OrderSize> {
        let query_price = integer_price(slippage_price(reference_price, side, self.slippage));
        let max_size = self
            .gateway
            .max_order_size(instrument.product_id, side, query_price)
            .await
            .with_context(|| format!("Failed to fetch max order size for {instrument}"))?
            .abs();

        let drawn = rng.uniform(self.percent.from, self.percent.to);
        let pct = Decimal::from_f64(drawn)
            .ok_or_else(|| anyhow!("Percent draw {drawn} is not representable"))?
            .round_dp(6)
            / Decimal::ONE_HUNDRED;

        let raw_amount = instrument.truncate_raw(max_size * pct * side.sign());

        debug!(
            instrument = %instrument,
            side = %side,
            max_size = %instrument.to_human(max_size),
            pct = %pct,
            amount = %instrument.to_human(raw_amount),
            "Order sized"
        );

        Ok(OrderSize {
            raw_amount,
            max_size,
            min_size: instrument.min_size,
            pct,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
