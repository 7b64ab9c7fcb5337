//! Timing and randomization utilities.
//!
//! Every random decision the engine makes (instrument, side, size percent,
//! pause lengths) goes through the [`Randomizer`] trait so tests can script
//! the draws. Pauses are cancellable through a [`Shutdown`] handle.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::types::{CyclerError, DrawRange, Side};

// ---------------------------------------------------------------------------
// Random draws
// ---------------------------------------------------------------------------

/// Source of random draws.
pub trait Randomizer: Send + Sync {
    /// Uniform draw in `[min, max]`. Returns `min` when `min >= max`.
    fn uniform(&mut self, min: f64, max: f64) -> f64;

    /// Uniform index in `0..len`. `len` must be non-zero.
    fn index(&mut self, len: usize) -> usize;

    /// Fair coin.
    fn coin(&mut self) -> bool;
}

/// Uniform pick over a slice. `None` for an empty slice.
pub fn pick_one<'a, T>(rng: &mut dyn Randomizer, items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    items.get(rng.index(items.len()))
}

/// Fair long/short draw.
pub fn pick_side(rng: &mut dyn Randomizer) -> Side {
    if rng.coin() {
        Side::Long
    } else {
        Side::Short
    }
}

/// `rand`-backed randomizer.
pub struct RngRandomizer<R: Rng + Send + Sync = StdRng> {
    rng: R,
}

impl RngRandomizer<StdRng> {
    /// Seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible sequence (paper runs).
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<R: Rng + Send + Sync> Randomizer for RngRandomizer<R> {
    fn uniform(&mut self, min: f64, max: f64) -> f64 {
        if min >= max {
            return min;
        }
        self.rng.gen_range(min..=max)
    }

    fn index(&mut self, len: usize) -> usize {
        self.rng.gen_range(0..len)
    }

    fn coin(&mut self) -> bool {
        self.rng.gen_bool(0.5)
    }
}

/// Replays fixed draws in order, cycling when exhausted. Uniform draws are
/// clamped into the requested range.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ScriptedRandomizer {
    pub uniforms: Vec<f64>,
    pub indices: Vec<usize>,
    pub coins: Vec<bool>,
    cursor: (usize, usize, usize),
}

#[cfg(test)]
impl ScriptedRandomizer {
    pub fn new(uniforms: Vec<f64>, indices: Vec<usize>, coins: Vec<bool>) -> Self {
        Self {
            uniforms,
            indices,
            coins,
            cursor: (0, 0, 0),
        }
    }
}

#[cfg(test)]
impl Randomizer for ScriptedRandomizer {
    fn uniform(&mut self, min: f64, max: f64) -> f64 {
        if self.uniforms.is_empty() {
            return min;
        }
        let v = self.uniforms[self.cursor.0 % self.uniforms.len()];
        self.cursor.0 += 1;
        v.clamp(min, max.max(min))
    }

    fn index(&mut self, len: usize) -> usize {
        if self.indices.is_empty() {
            return 0;
        }
        let v = self.indices[self.cursor.1 % self.indices.len()];
        self.cursor.1 += 1;
        v % len
    }

    fn coin(&mut self) -> bool {
        if self.coins.is_empty() {
            return true;
        }
        let v = self.coins[self.cursor.2 % self.coins.len()];
        self.cursor.2 += 1;
        v
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Fires the shutdown signal. Held by the signal handler in `main`.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a linked trigger/observer pair.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl Shutdown {
    /// An observer that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested. Pends forever if the
    /// trigger is dropped without firing.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pauses
// ---------------------------------------------------------------------------

/// Sleep for `duration` unless shutdown fires first.
pub async fn sleep_for(duration: Duration, shutdown: &mut Shutdown) -> Result<(), CyclerError> {
    if shutdown.is_triggered() {
        return Err(CyclerError::Interrupted);
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = shutdown.triggered() => Err(CyclerError::Interrupted),
    }
}

/// Sleep for a uniform draw in `range` seconds. Returns the drawn duration.
pub async fn pause(
    rng: &mut dyn Randomizer,
    range: DrawRange,
    shutdown: &mut Shutdown,
) -> Result<Duration, CyclerError> {
    let secs = rng.uniform(range.from, range.to).max(0.0);
    let duration = Duration::from_secs_f64(secs);
    debug!(secs = format!("{secs:.1}"), "Pausing");
    sleep_for(duration, shutdown).await?;
    Ok(duration)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
