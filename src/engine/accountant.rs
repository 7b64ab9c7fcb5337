//! Accountant: per-cycle balance tracking and run totals.
//!
//! Each completed, skipped, or failed cycle becomes a [`CycleRecord`]; the
//! accountant logs its balance delta and folds it into the [`RunSummary`]
//! returned when the controller exits.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use tracing::{info, warn};

use crate::types::{ProductId, Side};

// ---------------------------------------------------------------------------
// Cycle record
// ---------------------------------------------------------------------------

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Sized below the instrument minimum; no order placed.
    Skipped,
    /// A gateway query failed before any order was placed.
    Aborted,
    /// The open order was not accepted.
    OpenFailed,
    /// Opened but the close was not accepted; left to reconciliation.
    CloseFailed,
    /// Opened and closed.
    Completed,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::Aborted => "aborted",
            CycleOutcome::OpenFailed => "open failed",
            CycleOutcome::CloseFailed => "close failed",
            CycleOutcome::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Summary of one open/hold/close cycle. Logged, not retained.
#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub cycle_number: u64,
    pub product_id: Option<ProductId>,
    pub instrument: Option<String>,
    pub side: Option<Side>,
    /// Opened size in human units (zero when nothing was opened).
    pub size: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Option<Decimal>,
    pub outcome: CycleOutcome,
    pub timestamp: DateTime<Utc>,
}

impl CycleRecord {
    pub fn new(cycle_number: u64, balance_before: Decimal) -> Self {
        Self {
            cycle_number,
            product_id: None,
            instrument: None,
            side: None,
            size: Decimal::ZERO,
            balance_before,
            balance_after: None,
            outcome: CycleOutcome::Aborted,
            timestamp: Utc::now(),
        }
    }

    pub fn delta(&self) -> Option<Decimal> {
        self.balance_after.map(|after| after - self.balance_before)
    }

    /// Whether an open order was accepted this cycle.
    pub fn opened(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Completed | CycleOutcome::CloseFailed)
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Why the controller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Account health reached zero.
    HealthDepleted,
    /// Operator shutdown.
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::HealthDepleted => write!(f, "health depleted"),
            ExitReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub cycles: u64,
    pub opened: u64,
    pub completed: u64,
    pub skipped: u64,
    pub aborted: u64,
    pub failed_opens: u64,
    pub failed_closes: u64,
    pub forced_closes: u64,
    pub first_balance: Option<Decimal>,
    pub last_balance: Option<Decimal>,
    pub exit_reason: ExitReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// Net health change across the run, if both ends were observed.
    pub fn net_change(&self) -> Option<Decimal> {
        match (self.first_balance, self.last_balance) {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cycles ({} completed, {} skipped, {} open failures, {} close failures), {} forced closes, exit: {}",
            self.cycles,
            self.completed,
            self.skipped,
            self.failed_opens,
            self.failed_closes,
            self.forced_closes,
            self.exit_reason,
        )
    }
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Accountant {
    cycles: u64,
    opened: u64,
    completed: u64,
    skipped: u64,
    aborted: u64,
    failed_opens: u64,
    failed_closes: u64,
    forced_closes: u64,
    first_balance: Option<Decimal>,
    last_balance: Option<Decimal>,
    started_at: DateTime<Utc>,
}

impl Default for Accountant {
    fn default() -> Self {
        Self::new()
    }
}

impl Accountant {
    pub fn new() -> Self {
        Self {
            cycles: 0,
            opened: 0,
            completed: 0,
            skipped: 0,
            aborted: 0,
            failed_opens: 0,
            failed_closes: 0,
            forced_closes: 0,
            first_balance: None,
            last_balance: None,
            started_at: Utc::now(),
        }
    }

    /// Note a health reading taken outside a cycle (e.g. the gate check).
    pub fn observe_balance(&mut self, balance: Decimal) {
        if self.first_balance.is_none() {
            self.first_balance = Some(balance);
        }
        self.last_balance = Some(balance);
    }

    /// Fold a finished cycle into the totals and log its balance change.
    pub fn record(&mut self, record: &CycleRecord) {
        self.cycles += 1;
        if record.opened() {
            self.opened += 1;
        }
        match record.outcome {
            CycleOutcome::Completed => self.completed += 1,
            CycleOutcome::Skipped => self.skipped += 1,
            CycleOutcome::Aborted => self.aborted += 1,
            CycleOutcome::OpenFailed => self.failed_opens += 1,
            CycleOutcome::CloseFailed => self.failed_closes += 1,
        }

        self.observe_balance(record.balance_before);
        if let Some(after) = record.balance_after {
            self.observe_balance(after);
        }

        match record.delta() {
            Some(delta) => info!(
                cycle = record.cycle_number,
                instrument = record.instrument.as_deref().unwrap_or("-"),
                outcome = %record.outcome,
                balance = format!("{:.4}", record.balance_after.unwrap_or(record.balance_before)),
                "Balance change: {}",
                signed(delta)
            ),
            None => warn!(
                cycle = record.cycle_number,
                outcome = %record.outcome,
                "Balance change unknown, health query failed"
            ),
        }
    }

    pub fn record_forced_close(&mut self) {
        self.forced_closes += 1;
    }

    pub fn finish(&self, exit_reason: ExitReason) -> RunSummary {
        RunSummary {
            cycles: self.cycles,
            opened: self.opened,
            completed: self.completed,
            skipped: self.skipped,
            aborted: self.aborted,
            failed_opens: self.failed_opens,
            failed_closes: self.failed_closes,
            forced_closes: self.forced_closes,
            first_balance: self.first_balance,
            last_balance: self.last_balance,
            exit_reason,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

fn signed(delta: Decimal) -> String {
    if delta.is_sign_negative() && !delta.is_zero() {
        format!("{:.4}", delta)
    } else {
        format!("+{:.4}", delta)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
