//! Property-based tests for scoring invariants
//!
//! - Score is in [0, 100] and the tier follows the threshold table
//! - Weighted contributions sum to the score within rounding
//! - `assess` is repeatable against frozen state
//! - New customers get exactly the behavioral baseline
//! - `min ≤ average ≤ max` survives any sequence of profile updates
//! - Velocity risk never drops while a burst grows inside the window

mod common;

use chrono::Duration;
use common::*;
use fraud_risk_engine::config::{ProfileConfig, TierThresholds, VelocityConfig};
use fraud_risk_engine::profile::{amount_deviation, DailyBaseline, Observation};
use fraud_risk_engine::{
    BehaviorProfile, FactorKind, PaymentMethod, RiskScore, RiskTier, TransactionEvent,
    VelocityGuard,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..100_000_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

fn method_strategy() -> impl Strategy<Value = PaymentMethod> {
    prop_oneof![
        Just(PaymentMethod::CreditCard),
        Just(PaymentMethod::DebitCard),
        Just(PaymentMethod::InstantTransfer),
        Just(PaymentMethod::BankTransfer),
        Just(PaymentMethod::CashVoucher),
        Just(PaymentMethod::DigitalWallet),
    ]
}

fn ip_strategy() -> impl Strategy<Value = Option<&'static str>> {
    prop_oneof![
        Just(None),
        Just(Some(HOME_IP)),
        Just(Some(LISBON_IP)),
        Just(Some(TOR_EXIT_IP)),
    ]
}

prop_compose! {
    fn event_strategy()(
        customer in "[a-z]{3,10}",
        amount in amount_strategy(),
        method in method_strategy(),
        offset_secs in 0i64..7 * 86_400,
        ip in ip_strategy(),
        with_device in any::<bool>(),
        installments in prop::option::of(1u32..24),
    ) -> TransactionEvent {
        let mut event = TransactionEvent::new(
            customer,
            amount,
            "BRL",
            method,
            monday_afternoon() + Duration::seconds(offset_secs),
        );
        event.ip_address = ip.map(common::ip);
        if with_device {
            event.device = Some(home_device());
        }
        event.installments = installments;
        event
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: score range, tier table and weighted sum
    #[test]
    fn prop_score_is_bounded_and_consistent(event in event_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let t = engine();
            t.clock.set(event.timestamp);
            let decision = t.engine.evaluate(&event).await.unwrap();

            prop_assert!(decision.risk_score.score() <= 100);
            prop_assert_eq!(
                decision.risk_tier,
                RiskTier::from_score(decision.risk_score, &TierThresholds::default())
            );
            prop_assert_eq!(decision.factors.len(), FactorKind::ALL.len());
            for factor in &decision.factors {
                prop_assert!((0.0..=100.0).contains(&factor.score));
            }
            let sum = decision.weighted_sum();
            prop_assert!((sum - f64::from(decision.risk_score.score())).abs() <= 1.0);
            prop_assert!(decision.confidence <= 100);
            Ok(())
        })?;
    }

    /// Property: repeated assessment against frozen state is stable
    #[test]
    fn prop_assess_is_idempotent(event in event_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let t = engine();
            t.clock.set(event.timestamp);
            let first = t.engine.assess(&event).await.unwrap();
            let second = t.engine.assess(&event).await.unwrap();

            prop_assert_eq!(first.risk_score, second.risk_score);
            prop_assert_eq!(first.risk_tier, second.risk_tier);
            prop_assert_eq!(first.recommendations, second.recommendations);
            Ok(())
        })?;
    }

    /// Property: first transaction of an unknown customer scores the baseline
    #[test]
    fn prop_new_customer_baseline(event in event_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let t = engine();
            t.clock.set(event.timestamp);
            let decision = t.engine.evaluate(&event).await.unwrap();
            let behavior = decision.factor(FactorKind::BehavioralPattern).unwrap();
            prop_assert_eq!(behavior.score, 35.0);
            Ok(())
        })?;
    }

    /// Property: tiers partition 0..=100 in order
    #[test]
    fn prop_tier_is_monotonic(a in 0u8..=100, b in 0u8..=100) {
        let t = TierThresholds::default();
        let (low, high) = (a.min(b), a.max(b));
        prop_assert!(
            RiskTier::from_score(RiskScore::new(low), &t)
                <= RiskTier::from_score(RiskScore::new(high), &t)
        );
    }

    /// Property: profile bounds hold after any sequence of updates
    #[test]
    fn prop_profile_invariant(
        amounts in prop::collection::vec(amount_strategy(), 1..40),
        gaps in prop::collection::vec(-3_600i64..86_400, 40),
    ) {
        let config = ProfileConfig::default();
        let mut profile = BehaviorProfile::empty("prop", &config);
        let mut at = monday_afternoon();

        for (amount, gap) in amounts.iter().zip(gaps.iter()) {
            // Negative gaps deliver events out of order
            at = at + Duration::seconds(*gap);
            let event = TransactionEvent::new("prop", *amount, "BRL", PaymentMethod::DebitCard, at);
            profile.fold(
                &Observation {
                    event: &event,
                    local_hour: event.local_hour(-180),
                    risk_score: RiskScore::new(10),
                    risk_tier: RiskTier::VeryLow,
                    location: None,
                },
                &config,
            );
            prop_assert!(profile.invariants_hold());
            prop_assert!(profile.min_amount <= profile.average_amount);
            prop_assert!(profile.average_amount <= profile.max_amount);
        }
        prop_assert_eq!(profile.transaction_count, amounts.len() as u64);
    }

    /// Property: deviation is a bounded risk contribution
    #[test]
    fn prop_amount_deviation_bounded(amount in amount_strategy(), average in amount_strategy()) {
        let d = amount_deviation(amount, average);
        prop_assert!((0.0..=100.0).contains(&d));
        prop_assert_eq!(amount_deviation(average, average), 0.0);
    }

    /// Property: velocity contribution is non-decreasing within a window
    #[test]
    fn prop_velocity_monotonic(
        gaps in prop::collection::vec(0i64..5, 1..12),
        amounts in prop::collection::vec(amount_strategy(), 12),
    ) {
        let config = VelocityConfig::default();
        let baseline = DailyBaseline::prior(&config);
        let guard = VelocityGuard::new(config);
        let mut at = monday_afternoon();
        let mut previous = 0.0;

        for (gap, amount) in gaps.iter().zip(amounts.iter()) {
            at = at + Duration::seconds(*gap);
            let assessment =
                guard.check_and_register("burst", Uuid::new_v4(), *amount, at, &baseline);
            prop_assert!(assessment.contribution >= previous);
            prop_assert!(assessment.contribution <= 100.0);
            previous = assessment.contribution;
        }
    }
}
