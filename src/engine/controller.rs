//! Cycle controller, the main open → hold → close loop.
//!
//! One cycle at a time: gate on account health, pick an instrument and a
//! side, open a random fraction of the max order size, hold for a random
//! pause, close the exact opened amount, let fill history settle, then
//! reconcile every tracked instrument before pausing again. Nothing about positions is cached;
//! each decision re-queries the gateway.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::engine::accountant::{Accountant, CycleOutcome, CycleRecord, ExitReason, RunSummary};
use crate::engine::reconciler::{ReconcileOutcome, ReconcilePolicy, Reconciler};
use crate::engine::selector::Selector;
use crate::engine::timing::{pause, pick_side, sleep_for, Randomizer, Shutdown};
use crate::gateway::ExchangeGateway;
use crate::types::{
    integer_price, CyclerError, DrawRange, Instrument, InstrumentBook, OrderIntent, OrderResult,
    TrackedInstruments,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub tracked: TrackedInstruments,
    pub slippage: Decimal,
    pub order_ttl: chrono::Duration,
    pub percent: DrawRange,
    pub before_close: DrawRange,
    pub between_trades: DrawRange,
    pub reconcile: ReconcilePolicy,
}

impl ControllerConfig {
    pub fn from_app(config: &AppConfig) -> Result<Self, CyclerError> {
        Ok(Self {
            tracked: config.tracked()?,
            slippage: config.trading.slippage,
            order_ttl: config.order_ttl(),
            percent: config.trading.percent,
            before_close: config.pause.before_close,
            between_trades: config.pause.between_trades,
            reconcile: config.reconcile_policy(),
        })
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct CycleController {
    gateway: Arc<dyn ExchangeGateway>,
    config: ControllerConfig,
    selector: Selector,
    reconciler: Reconciler,
    rng: Box<dyn Randomizer>,
    shutdown: Shutdown,
    accountant: Accountant,
}

impl CycleController {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        config: ControllerConfig,
        rng: Box<dyn Randomizer>,
        shutdown: Shutdown,
    ) -> Self {
        let selector = Selector::new(gateway.clone(), config.slippage, config.percent);
        let reconciler = Reconciler::new(gateway.clone(), config.reconcile.clone());
        Self {
            gateway,
            config,
            selector,
            reconciler,
            rng,
            shutdown,
            accountant: Accountant::new(),
        }
    }

    /// Run until health is depleted or shutdown is requested.
    ///
    /// Errors only for fatal conditions: unusable instrument metadata at
    /// startup or a residual that exhausted its close attempts.
    pub async fn run(&mut self) -> Result<RunSummary, CyclerError> {
        let book = self.load_book().await?;
        info!(
            tracked = %self.config.tracked,
            instruments = book.len(),
            "Instrument book loaded"
        );

        let reason = match self.run_loop(&book).await {
            Ok(reason) => reason,
            Err(CyclerError::Interrupted) => ExitReason::Shutdown,
            Err(e) => {
                error!(error = %e, "Cycle loop stopped");
                return Err(e);
            }
        };

        let summary = self.accountant.finish(reason);
        info!(
            cycles = summary.cycles,
            completed = summary.completed,
            skipped = summary.skipped,
            forced_closes = summary.forced_closes,
            reason = %summary.exit_reason,
            "Cycle loop finished"
        );
        Ok(summary)
    }

    async fn run_loop(&mut self, book: &InstrumentBook) -> Result<ExitReason, CyclerError> {
        // A previous run may have died mid-cycle.
        self.reconcile_all(book).await?;

        let mut cycle: u64 = 0;
        loop {
            if self.shutdown.is_triggered() {
                return Ok(ExitReason::Shutdown);
            }

            let balance = match self.gateway.account_health().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "Health query failed, waiting before retry");
                    pause(self.rng.as_mut(), self.config.between_trades, &mut self.shutdown).await?;
                    continue;
                }
            };
            self.accountant.observe_balance(balance);

            if balance <= Decimal::ZERO {
                warn!(balance = %balance, "Account health depleted, stopping");
                return Ok(ExitReason::HealthDepleted);
            }

            cycle += 1;
            info!(cycle, balance = format!("{:.4}", balance), "Starting cycle");

            let mut record = self.run_cycle(cycle, balance, book).await?;

            record.balance_after = match self.gateway.account_health().await {
                Ok(after) => Some(after),
                Err(e) => {
                    warn!(error = %e, "Post-cycle health query failed");
                    None
                }
            };
            self.accountant.record(&record);

            // Fill history lags accepted orders; reading it straight after
            // the close would still show the open as the latest fill.
            if record.outcome == CycleOutcome::Completed {
                sleep_for(self.config.reconcile.settle, &mut self.shutdown).await?;
            }
            self.reconcile_all(book).await?;

            let waited = pause(self.rng.as_mut(), self.config.between_trades, &mut self.shutdown).await?;
            info!(secs = format!("{:.1}", waited.as_secs_f64()), "Paused between trades");
        }
    }

    /// Resolve tracked product ids into instrument metadata.
    async fn load_book(&self) -> Result<InstrumentBook, CyclerError> {
        let instruments = match &self.config.tracked {
            TrackedInstruments::Auto => self
                .gateway
                .list_instruments()
                .await
                .map_err(|e| metadata_error(&e))?,
            TrackedInstruments::Fixed(ids) => {
                let mut instruments = Vec::with_capacity(ids.len());
                for id in ids {
                    let instrument = self
                        .gateway
                        .instrument(*id)
                        .await
                        .map_err(|e| metadata_error(&e))?;
                    instruments.push(instrument);
                }
                instruments
            }
        };

        if instruments.is_empty() {
            return Err(CyclerError::Config("No tradable instruments available".into()));
        }
        Ok(InstrumentBook::new(instruments))
    }

    /// Reconcile every instrument that must be flat before the next open.
    async fn reconcile_all(&mut self, book: &InstrumentBook) -> Result<(), CyclerError> {
        for product_id in self.config.tracked.reconcile_set(book) {
            let instrument = book.get(product_id)?;
            match self.reconciler.reconcile(instrument, &mut self.shutdown).await? {
                ReconcileOutcome::Clean => {}
                ReconcileOutcome::Flattened { residual, attempts } => {
                    info!(
                        instrument = %instrument,
                        residual = %instrument.to_human(residual),
                        attempts,
                        "Residual position flattened"
                    );
                    self.accountant.record_forced_close();
                }
            }
        }
        Ok(())
    }

    /// One open/hold/close cycle.
    ///
    /// Gateway failures end the cycle with the matching outcome; only
    /// shutdown (and unknown instruments) escape as errors.
    async fn run_cycle(
        &mut self,
        cycle: u64,
        balance: Decimal,
        book: &InstrumentBook,
    ) -> Result<CycleRecord, CyclerError> {
        let mut record = CycleRecord::new(cycle, balance);

        let product_id = match self
            .selector
            .select_instrument(&self.config.tracked, book, self.rng.as_mut())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(cycle, error = %e, "Instrument selection failed");
                return Ok(record);
            }
        };
        let instrument = book.get(product_id)?.clone();
        let side = pick_side(self.rng.as_mut());
        record.product_id = Some(product_id);
        record.instrument = Some(instrument.name.clone());
        record.side = Some(side);

        let open_price = match self.gateway.mark_price(product_id).await {
            Ok(p) => integer_price(p),
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Price query failed");
                return Ok(record);
            }
        };

        let size = match self
            .selector
            .compute_order_size(&instrument, side, open_price, self.rng.as_mut())
            .await
        {
            Ok(size) => size,
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Order sizing failed");
                return Ok(record);
            }
        };

        info!(
            cycle,
            instrument = %instrument,
            side = %side,
            price = %open_price,
            percent = %(size.pct * Decimal::ONE_HUNDRED).normalize(),
            size = %instrument.to_human(size.raw_amount),
            max_size = %instrument.to_human(size.max_size),
            "Cycle plan"
        );

        if !size.is_placeable() {
            info!(
                instrument = %instrument,
                size = %instrument.to_human(size.raw_amount),
                min_size = %instrument.to_human(size.min_size),
                "Size too small, skipping cycle"
            );
            record.outcome = CycleOutcome::Skipped;
            return Ok(record);
        }

        // Open
        if self.shutdown.is_triggered() {
            return Err(CyclerError::Interrupted);
        }
        let open = self.submit(&instrument, size.raw_amount, open_price).await;
        info!(instrument = %instrument, side = %side, "Open order: {}", open.status);
        if !open.is_success() {
            warn!(instrument = %instrument, reason = %open.message, "Open order not accepted");
            record.outcome = CycleOutcome::OpenFailed;
            return Ok(record);
        }
        record.size = instrument.to_human(size.raw_amount);

        // Hold
        if let Err(e) = pause(self.rng.as_mut(), self.config.before_close, &mut self.shutdown).await {
            warn!(
                instrument = %instrument,
                size = %record.size,
                "Shutdown while holding, position left open for the next start to reconcile"
            );
            return Err(e);
        }

        // Close
        let close_price = match self.gateway.mark_price(product_id).await {
            Ok(p) => integer_price(p),
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Close price query failed");
                record.outcome = CycleOutcome::CloseFailed;
                return Ok(record);
            }
        };
        if self.shutdown.is_triggered() {
            warn!(instrument = %instrument, "Shutdown before close, position left open");
            return Err(CyclerError::Interrupted);
        }
        let close = self.submit(&instrument, -size.raw_amount, close_price).await;
        info!(instrument = %instrument, side = %side.opposite(), "Close order: {}", close.status);
        if close.is_success() {
            record.outcome = CycleOutcome::Completed;
        } else {
            warn!(
                instrument = %instrument,
                reason = %close.message,
                "Close order not accepted, leaving it to reconciliation"
            );
            record.outcome = CycleOutcome::CloseFailed;
        }
        Ok(record)
    }

    async fn submit(&self, instrument: &Instrument, amount: Decimal, price: Decimal) -> OrderResult {
        let intent = OrderIntent::new(
            instrument.product_id,
            amount,
            price,
            self.config.slippage,
            self.config.order_ttl,
            self.gateway.order_nonce(),
        );
        match self.gateway.submit_order(&intent).await {
            Ok(result) => result,
            Err(e) => {
                warn!(order = %intent, error = %e, "Order submission failed");
                OrderResult::from_error(&e)
            }
        }
    }
}

fn metadata_error(e: &anyhow::Error) -> CyclerError {
    CyclerError::Gateway {
        gateway: "instrument metadata".to_string(),
        message: format!("{e:#}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
