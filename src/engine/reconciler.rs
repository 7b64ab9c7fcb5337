//! Reconciliation engine.
//!
//! Detects a residual position left behind by a failed close (the latest
//! fill's post-trade base balance is non-zero) and force-closes it. A
//! residual blocks all further trading, so a failed close is retried after
//! a cooldown until it succeeds, unless an attempt cap is configured.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::engine::timing::{sleep_for, Shutdown};
use crate::gateway::ExchangeGateway;
use crate::types::{integer_price, CyclerError, Instrument, OrderIntent, OrderResult};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// How many recent fills to inspect.
    pub lookback: usize,
    /// Wait between failed attempts.
    pub cooldown: Duration,
    /// Wait after a successful close so indexed state catches up.
    pub settle: Duration,
    /// Cap on close submissions. `None` retries until shutdown.
    pub max_attempts: Option<u32>,
    pub slippage: Decimal,
    pub order_ttl: chrono::Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            lookback: 10,
            cooldown: Duration::from_secs(10),
            settle: Duration::from_secs(5),
            max_attempts: None,
            slippage: crate::types::DEFAULT_SLIPPAGE,
            order_ttl: chrono::Duration::seconds(60),
        }
    }
}

/// What a reconciliation pass found and did.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// No residual; nothing submitted.
    Clean,
    /// A residual was closed after `attempts` submissions.
    Flattened { residual: Decimal, attempts: u32 },
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    gateway: Arc<dyn ExchangeGateway>,
    policy: ReconcilePolicy,
}

impl Reconciler {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, policy: ReconcilePolicy) -> Self {
        Self { gateway, policy }
    }

    /// Ensure `instrument` has no residual position.
    ///
    /// Returns only once the latest fill shows a flat balance or a close
    /// order has been accepted. Gateway errors and rejected closes are
    /// retried after the cooldown.
    pub async fn reconcile(
        &self,
        instrument: &Instrument,
        shutdown: &mut Shutdown,
    ) -> Result<ReconcileOutcome, CyclerError> {
        let mut attempts: u32 = 0;

        loop {
            if shutdown.is_triggered() {
                return Err(CyclerError::Interrupted);
            }

            let fills = match self
                .gateway
                .recent_fills(instrument.product_id, self.policy.lookback)
                .await
            {
                Ok(fills) => fills,
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "Fill history query failed, retrying");
                    sleep_for(self.policy.cooldown, shutdown).await?;
                    continue;
                }
            };

            let residual = fills
                .first()
                .map(|f| f.post_base_balance)
                .unwrap_or(Decimal::ZERO);

            if residual.is_zero() {
                debug!(instrument = %instrument, "No residual position");
                return Ok(ReconcileOutcome::Clean);
            }

            warn!(
                instrument = %instrument,
                residual = %instrument.to_human(residual),
                residual_raw = %residual,
                attempt = attempts + 1,
                "Residual position found, force closing"
            );

            let price = match self.gateway.mark_price(instrument.product_id).await {
                Ok(p) => integer_price(p),
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "Price query failed, retrying");
                    sleep_for(self.policy.cooldown, shutdown).await?;
                    continue;
                }
            };

            if shutdown.is_triggered() {
                return Err(CyclerError::Interrupted);
            }

            attempts += 1;
            let intent = OrderIntent::new(
                instrument.product_id,
                -residual,
                price,
                self.policy.slippage,
                self.policy.order_ttl,
                self.gateway.order_nonce(),
            );
            let result = match self.gateway.submit_order(&intent).await {
                Ok(r) => r,
                Err(e) => OrderResult::from_error(&e),
            };

            info!(
                instrument = %instrument,
                status = %result.status,
                attempt = attempts,
                "Force close: {}",
                result.status
            );

            if result.is_success() {
                sleep_for(self.policy.settle, shutdown).await?;
                return Ok(ReconcileOutcome::Flattened { residual, attempts });
            }

            warn!(
                instrument = %instrument,
                attempt = attempts,
                reason = %result.message,
                "Force close failed"
            );

            if let Some(max) = self.policy.max_attempts {
                if attempts >= max {
                    error!(
                        instrument = %instrument,
                        attempts,
                        "Residual position could not be closed, giving up"
                    );
                    return Err(CyclerError::UnsafeResidual {
                        product_id: instrument.product_id,
                        residual,
                        attempts,
                    });
                }
            }

            sleep_for(self.policy.cooldown, shutdown).await?;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
