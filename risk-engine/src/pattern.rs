//! Domain heuristics over a single transaction

use crate::config::{MarketConfig, PatternConfig};
use crate::types::{PaymentMethod, TransactionEvent};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

const METHOD_CEILING_RISK: f64 = 20.0;
const AMOUNT_PATTERN_RISK: f64 = 15.0;
const LOCALE_RISK: f64 = 10.0;
const TIMEZONE_RISK: f64 = 12.0;
const CURRENCY_RISK: f64 = 10.0;
const INSTALLMENT_RISK_MAX: f64 = 15.0;
const SINGLE_INSTALLMENT_RISK: f64 = 10.0;

/// Pattern contribution and the rules that fired
#[derive(Debug, Clone, PartialEq)]
pub struct PatternAssessment {
    /// Contribution (0-100)
    pub contribution: f64,
    /// Rules that fired
    pub reasons: Vec<String>,
}

impl PatternAssessment {
    /// Human-readable summary
    pub fn describe(&self) -> String {
        if self.reasons.is_empty() {
            "no suspicious payment pattern".to_string()
        } else {
            self.reasons.join("; ")
        }
    }
}

/// Scores method, amount, market and installment heuristics
#[derive(Debug, Clone)]
pub struct PatternRiskEvaluator {
    config: PatternConfig,
    market: MarketConfig,
}

impl PatternRiskEvaluator {
    /// Create new evaluator
    pub fn new(config: PatternConfig, market: MarketConfig) -> Self {
        Self { config, market }
    }

    /// Score a transaction; pure
    pub fn evaluate(&self, event: &TransactionEvent) -> PatternAssessment {
        let mut contribution = 0.0;
        let mut reasons = Vec::new();
        let amount = event.amount;

        if let Some(ceiling) = self.config.ceiling(event.payment_method) {
            if amount > ceiling {
                contribution += METHOD_CEILING_RISK;
                reasons.push(format!(
                    "{} amount {} above typical ceiling {}",
                    event.payment_method, amount, ceiling
                ));
            }
        }

        if let Some(pattern) = self.amount_pattern(amount) {
            contribution += AMOUNT_PATTERN_RISK;
            reasons.push(pattern);
        }

        let locale = event
            .locale
            .as_deref()
            .or_else(|| event.device.as_ref().and_then(|d| d.language.as_deref()));
        if let Some(locale) = locale {
            if !self.market.is_expected_locale(locale) {
                contribution += LOCALE_RISK;
                reasons.push(format!("locale {} outside expected market", locale));
            }
        }

        if let Some(tz) = event.device.as_ref().and_then(|d| d.timezone.as_deref()) {
            if !self.market.is_expected_timezone(tz) {
                contribution += TIMEZONE_RISK;
                reasons.push(format!("time zone {} outside expected market", tz));
            }
        }

        if !event.currency.eq_ignore_ascii_case(&self.market.currency) {
            contribution += CURRENCY_RISK;
            reasons.push(format!("currency {} differs from {}", event.currency, self.market.currency));
        }

        let installment = self.installment_risk(event);
        if installment > 0.0 {
            contribution += installment;
            reasons.push(format!(
                "unusual installment plan ({} x {})",
                event.installments.unwrap_or(1),
                amount
            ));
        }

        PatternAssessment {
            contribution: f64::min(contribution, 100.0),
            reasons,
        }
    }

    fn amount_pattern(&self, amount: Decimal) -> Option<String> {
        let fraction = amount.fract();

        if amount >= self.config.large_amount_threshold && !fraction.is_zero() {
            return Some(format!("non-round large amount {}", amount));
        }

        if amount <= self.config.card_testing_ceiling {
            let cents = (fraction * Decimal::ONE_HUNDRED).round().to_u32().unwrap_or(0);
            if cents == 1 || cents == 99 || amount < Decimal::TWO {
                return Some(format!("card-testing amount {}", amount));
            }
        }

        None
    }

    fn installment_risk(&self, event: &TransactionEvent) -> f64 {
        let count = event.installments.unwrap_or(1).max(1);
        let mut risk = 0.0;

        if count > 1 && self.config.min_installment_value > Decimal::ZERO {
            let per_installment = event.amount / Decimal::from(count);
            if per_installment < self.config.min_installment_value {
                let shortfall = (Decimal::ONE - per_installment / self.config.min_installment_value)
                    .to_f64()
                    .unwrap_or(1.0);
                risk += (INSTALLMENT_RISK_MAX * shortfall).round();
            }
        }

        if count == 1
            && event.payment_method == PaymentMethod::CreditCard
            && event.amount >= self.config.multi_installment_norm_amount
        {
            risk += SINGLE_INSTALLMENT_RISK;
        }

        f64::min(risk, INSTALLMENT_RISK_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DevicePayload;
    use chrono::Utc;

    fn evaluator() -> PatternRiskEvaluator {
        PatternRiskEvaluator::new(PatternConfig::default(), MarketConfig::default())
    }

    fn event(amount: Decimal, method: PaymentMethod) -> TransactionEvent {
        TransactionEvent::new("ivan", amount, "BRL", method, Utc::now()).with_locale("pt-BR", -180)
    }

    #[test]
    fn test_ordinary_payment_is_clean() {
        let a = evaluator().evaluate(&event(Decimal::from(250), PaymentMethod::DebitCard));
        assert_eq!(a.contribution, 0.0);
        assert!(a.reasons.is_empty());
    }

    #[test]
    fn test_cash_voucher_above_ceiling() {
        let a = evaluator().evaluate(&event(Decimal::from(4_000), PaymentMethod::CashVoucher));
        assert_eq!(a.contribution, 20.0);
    }

    #[test]
    fn test_amount_patterns() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate(&event(Decimal::new(12_345_67, 2), PaymentMethod::InstantTransfer))
                .contribution,
            15.0
        );
        assert_eq!(
            eval.evaluate(&event(Decimal::new(1_00, 2), PaymentMethod::DebitCard)).contribution,
            15.0
        );
        assert_eq!(
            eval.evaluate(&event(Decimal::new(9_99, 2), PaymentMethod::DebitCard)).contribution,
            15.0
        );
        assert_eq!(
            eval.evaluate(&event(Decimal::new(9_50, 2), PaymentMethod::DebitCard)).contribution,
            0.0
        );
    }

    #[test]
    fn test_market_signals() {
        let mut e = TransactionEvent::new("ivan", Decimal::from(100), "usd", PaymentMethod::DebitCard, Utc::now())
            .with_locale("en-US", 0)
            .with_device(DevicePayload {
                timezone: Some("Europe/Lisbon".to_string()),
                ..Default::default()
            });
        let a = evaluator().evaluate(&e);
        assert_eq!(a.contribution, 32.0);

        e.locale = None;
        // Falls back to the device language, which is absent here
        assert_eq!(evaluator().evaluate(&e).contribution, 22.0);
    }

    #[test]
    fn test_installment_ratios() {
        let eval = evaluator();
        let tiny = event(Decimal::from(120), PaymentMethod::CreditCard).with_installments(12);
        // 10 per installment against a 50 minimum → round(15 * 0.8)
        assert_eq!(eval.evaluate(&tiny).contribution, 12.0);

        let single = event(Decimal::from(30_000), PaymentMethod::CreditCard).with_installments(1);
        assert_eq!(eval.evaluate(&single).contribution, 10.0);

        let split = event(Decimal::from(30_000), PaymentMethod::CreditCard).with_installments(10);
        assert_eq!(eval.evaluate(&split).contribution, 0.0);
    }
}
