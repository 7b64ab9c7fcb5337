//! End-to-end controller runs against the mock gateway.
//!
//! Time is paused, so hold and between-trades pauses complete instantly.
//! Runs end either on a scripted zero health reading or on a shutdown
//! fired by the mock after a given number of submissions.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use cycler::engine::accountant::ExitReason;
use cycler::engine::controller::{ControllerConfig, CycleController};
use cycler::engine::reconciler::ReconcilePolicy;
use cycler::engine::timing::{shutdown_channel, Randomizer, RngRandomizer, Shutdown};
use cycler::types::{CyclerError, DrawRange, RewardCoefficient, TrackedInstruments};

use crate::mock_gateway::{btc, FixedDraws, MockGateway, ONE};

fn config(tracked: TrackedInstruments) -> ControllerConfig {
    ControllerConfig {
        tracked,
        slippage: dec!(0.005),
        order_ttl: chrono::Duration::seconds(60),
        percent: DrawRange::new(70.0, 90.0),
        before_close: DrawRange::new(10.0, 20.0),
        between_trades: DrawRange::new(20.0, 40.0),
        reconcile: ReconcilePolicy::default(),
    }
}

fn controller(
    gateway: &Arc<MockGateway>,
    config: ControllerConfig,
    rng: impl Randomizer + 'static,
    shutdown: Shutdown,
) -> CycleController {
    CycleController::new(gateway.clone(), config, Box::new(rng), shutdown)
}

/// `n` cycles' worth of healthy readings followed by depletion.
fn healthy_for(cycles: usize) -> Vec<Decimal> {
    let mut readings = vec![dec!(100); cycles * 2];
    readings.push(Decimal::ZERO);
    readings
}

#[tokio::test(start_paused = true)]
async fn test_single_cycle_opens_and_closes_exact_amount() {
    let gw = Arc::new(MockGateway::new(&healthy_for(1)));
    let mut ctl = controller(
        &gw,
        config(TrackedInstruments::Fixed(vec![2])),
        FixedDraws::new(&[80.0], &[true]),
        Shutdown::never(),
    );

    let summary = ctl.run().await.unwrap();
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.exit_reason, ExitReason::HealthDepleted);

    let orders = gw.submissions();
    assert_eq!(orders.len(), 2);
    // 80% of 1 BTC
    assert_eq!(orders[0].amount, dec!(800000000000000000));
    assert_eq!(orders[0].limit_price, dec!(60300));
    assert_eq!(orders[1].amount, dec!(-800000000000000000));
    assert_eq!(orders[1].limit_price, dec!(59700));
    assert!(gw.position(2).is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_zero_health_places_nothing() {
    let gw = Arc::new(MockGateway::new(&[Decimal::ZERO]));
    let mut ctl = controller(
        &gw,
        config(TrackedInstruments::Fixed(vec![2, 4])),
        FixedDraws::new(&[80.0], &[true]),
        Shutdown::never(),
    );

    let summary = ctl.run().await.unwrap();
    assert_eq!(summary.cycles, 0);
    assert_eq!(summary.exit_reason, ExitReason::HealthDepleted);
    assert!(gw.submissions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_close_always_negates_open() {
    const CYCLES: usize = 6;
    let gw = Arc::new(MockGateway::new(&healthy_for(CYCLES)));
    let mut ctl = controller(
        &gw,
        config(TrackedInstruments::Fixed(vec![2, 4])),
        RngRandomizer::seeded(21),
        Shutdown::never(),
    );

    let summary = ctl.run().await.unwrap();
    assert_eq!(summary.completed, CYCLES as u64);

    let orders = gw.submissions();
    assert_eq!(orders.len(), CYCLES * 2);
    for pair in orders.chunks(2) {
        assert_eq!(pair[0].product_id, pair[1].product_id);
        assert_eq!(pair[1].amount, -pair[0].amount);
        assert!(pair[0].nonce != pair[1].nonce);
    }
    assert!(gw.position(2).is_zero());
    assert!(gw.position(4).is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_size_below_minimum_skips_cycle() {
    let gw = Arc::new(MockGateway::new(&healthy_for(1)));
    // 0.001 BTC max: 80% truncates to zero
    gw.set_max_size(2, dec!(1000000000000000));
    let mut ctl = controller(
        &gw,
        config(TrackedInstruments::Fixed(vec![2])),
        FixedDraws::new(&[80.0], &[true]),
        Shutdown::never(),
    );

    let summary = ctl.run().await.unwrap();
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.skipped, 1);
    assert!(gw.submissions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_open_never_below_minimum_across_random_sizes() {
    const CASES: u64 = 150;
    let mut rng = StdRng::seed_from_u64(0xC1C1E);
    let mut expected_skips = 0u64;
    let mut skipped = 0u64;

    for case in 0..CASES {
        // minimum 0.001..=0.5 BTC, max anywhere from dust to 1 BTC
        let min_size = Decimal::from(rng.gen_range(1..=500u64)) * dec!(1000000000000000);
        let max_size = Decimal::from(rng.gen_range(0..=1_000_000_000_000_000_000u64));
        let thousandths: i64 = rng.gen_range(1_000..=100_000);
        let percent = thousandths as f64 / 1000.0;
        let long = rng.gen_bool(0.5);

        let gw = Arc::new(MockGateway::new(&healthy_for(1)).with_min_size(2, min_size));
        gw.set_max_size(2, max_size);
        let mut cfg = config(TrackedInstruments::Fixed(vec![2]));
        cfg.percent = DrawRange::new(1.0, 100.0);
        let mut ctl = controller(&gw, cfg, FixedDraws::new(&[percent], &[long]), Shutdown::never());

        let summary = ctl.run().await.unwrap();
        skipped += summary.skipped;

        let pct = Decimal::new(thousandths, 3) / Decimal::ONE_HUNDRED;
        let planned = btc().truncate_raw(max_size * pct);
        let below = planned.is_zero() || planned < min_size;
        if below {
            expected_skips += 1;
        }

        let orders = gw.submissions();
        if below {
            assert!(orders.is_empty(), "case {case}: opened {planned} under minimum {min_size}");
        } else {
            assert_eq!(orders.len(), 2, "case {case}");
            assert!(orders[0].amount.abs() >= min_size, "case {case}");
            assert_eq!(orders[0].amount.abs(), planned, "case {case}");
        }
    }

    assert_eq!(skipped, expected_skips);
    assert!(expected_skips > 0 && expected_skips < CASES);
}

#[tokio::test(start_paused = true)]
async fn test_lagging_fill_history_does_not_reverse_a_completed_close() {
    let gw = Arc::new(MockGateway::new(&healthy_for(1)));
    gw.lag_fills(Duration::from_secs(3));
    let mut ctl = controller(
        &gw,
        config(TrackedInstruments::Fixed(vec![2])),
        FixedDraws::new(&[80.0], &[true]),
        Shutdown::never(),
    );

    let summary = ctl.run().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.forced_closes, 0);

    let orders = gw.submissions();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[1].amount, -orders[0].amount);
    assert!(gw.position(2).is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_open_is_not_retried() {
    let gw = Arc::new(MockGateway::new(&healthy_for(1)));
    gw.reject_submission(0);
    let mut ctl = controller(
        &gw,
        config(TrackedInstruments::Fixed(vec![2])),
        FixedDraws::new(&[80.0], &[true]),
        Shutdown::never(),
    );

    let summary = ctl.run().await.unwrap();
    assert_eq!(summary.failed_opens, 1);
    assert_eq!(gw.submissions().len(), 1);
    assert!(gw.position(2).is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_failed_close_is_reconciled_before_next_cycle() {
    let gw = Arc::new(MockGateway::new(&healthy_for(1)));
    gw.reject_submission(1);
    let mut ctl = controller(
        &gw,
        config(TrackedInstruments::Fixed(vec![2])),
        FixedDraws::new(&[80.0], &[false]),
        Shutdown::never(),
    );

    let summary = ctl.run().await.unwrap();
    assert_eq!(summary.failed_closes, 1);
    assert_eq!(summary.forced_closes, 1);

    let orders = gw.submissions();
    assert_eq!(orders.len(), 3);
    assert_eq!(orders[0].amount, dec!(-800000000000000000));
    assert_eq!(orders[2].amount, -orders[0].amount);
    assert!(gw.position(2).is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_startup_flattens_leftover_position() {
    let gw = Arc::new(MockGateway::new(&[Decimal::ZERO]));
    // 0.05 ETH left by a previous run
    gw.leave_position(4, dec!(50000000000000000));
    let mut ctl = controller(
        &gw,
        config(TrackedInstruments::Fixed(vec![4])),
        FixedDraws::new(&[80.0], &[true]),
        Shutdown::never(),
    );

    let summary = ctl.run().await.unwrap();
    assert_eq!(summary.cycles, 0);
    assert_eq!(summary.forced_closes, 1);

    let orders = gw.submissions();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].amount, dec!(-50000000000000000));
    assert_eq!(orders[0].limit_price, dec!(2985));
    assert!(gw.position(4).is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_auto_mode_trades_highest_reward() {
    let gw = Arc::new(MockGateway::new(&healthy_for(1)));
    gw.set_coefficients(vec![
        RewardCoefficient { product_id: 2, coefficient: dec!(0.3) },
        RewardCoefficient { product_id: 4, coefficient: dec!(0.7) },
    ]);
    let mut ctl = controller(
        &gw,
        config(TrackedInstruments::Auto),
        FixedDraws::new(&[80.0], &[true]),
        Shutdown::never(),
    );

    let summary = ctl.run().await.unwrap();
    assert_eq!(summary.completed, 1);

    let orders = gw.submissions();
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.product_id == 4));
    // 80% of 10 ETH
    assert_eq!(orders[0].amount, ONE * dec!(8));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_hold_is_recovered_on_restart() {
    let gw = Arc::new(MockGateway::new(&[dec!(100), Decimal::ZERO]));
    let (trigger, shutdown) = shutdown_channel();
    gw.shutdown_after_submissions(1, trigger);

    let mut first = controller(
        &gw,
        config(TrackedInstruments::Fixed(vec![2])),
        FixedDraws::new(&[80.0], &[true]),
        shutdown,
    );
    let summary = first.run().await.unwrap();
    assert_eq!(summary.exit_reason, ExitReason::Shutdown);
    assert_eq!(gw.submissions().len(), 1);
    assert_eq!(gw.position(2), dec!(800000000000000000));

    let mut second = controller(
        &gw,
        config(TrackedInstruments::Fixed(vec![2])),
        FixedDraws::new(&[80.0], &[true]),
        Shutdown::never(),
    );
    let summary = second.run().await.unwrap();
    assert_eq!(summary.forced_closes, 1);
    assert_eq!(summary.cycles, 0);

    let orders = gw.submissions();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[1].amount, -orders[0].amount);
    assert!(gw.position(2).is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_capped_reconcile_escalates() {
    let gw = Arc::new(MockGateway::new(&[dec!(100)]));
    gw.leave_position(2, dec!(3000000000000000));
    gw.reject_everything();

    let mut cfg = config(TrackedInstruments::Fixed(vec![2]));
    cfg.reconcile.max_attempts = Some(3);
    let mut ctl = controller(&gw, cfg, FixedDraws::new(&[80.0], &[true]), Shutdown::never());

    match ctl.run().await {
        Err(CyclerError::UnsafeResidual { product_id, residual, attempts }) => {
            assert_eq!(product_id, 2);
            assert_eq!(residual, dec!(3000000000000000));
            assert_eq!(attempts, 3);
        }
        other => panic!("expected escalation, got {other:?}"),
    }
    assert_eq!(gw.submissions().len(), 3);
}
