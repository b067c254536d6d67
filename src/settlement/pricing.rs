use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use super::event::EventLineItem;
use crate::error::SettlementError;

const MINOR_UNIT_SCALE: u32 = 2;

/// Per-line amounts in minor units; `gross == fee + net` always holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineAmounts {
    pub unit_price: i64,
    pub gross: i64,
    pub fee: i64,
    pub net: i64,
}

/// Turns an event line into minor-unit amounts
pub trait PriceBreakdown: Send + Sync {
    fn breakdown(&self, line: &EventLineItem) -> Result<LineAmounts, SettlementError>;
}

fn scale_to_minor(amount: Decimal) -> Option<Decimal> {
    amount.checked_mul(Decimal::from(10_i64.pow(MINOR_UNIT_SCALE)))
}

/// Major units -> minor units, half away from zero. `None` when out of range.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    scale_to_minor(amount)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Fee amounts: major units -> minor units, rounded down
pub fn fee_minor_units(amount: Decimal) -> Option<i64> {
    scale_to_minor(amount)?
        // strip float noise such as 99.99999999 before flooring
        .round_dp(6)
        .floor()
        .to_i64()
}

fn invalid(line: &EventLineItem, reason: impl Into<String>) -> SettlementError {
    SettlementError::InvalidLine {
        product_id: line.product_id.clone(),
        reason: reason.into(),
    }
}

fn split(
    line: &EventLineItem,
    unit_price: i64,
    gross: i64,
    fee: i64,
) -> Result<LineAmounts, SettlementError> {
    if unit_price < 0 || gross < 0 || fee < 0 {
        return Err(invalid(line, "negative amount"));
    }
    if fee > gross {
        return Err(invalid(line, format!("fee {} exceeds gross {}", fee, gross)));
    }

    Ok(LineAmounts {
        unit_price,
        gross,
        fee,
        net: gross - fee,
    })
}

/// Trusts the upstream breakdown, only normalizing it to minor units
#[derive(Debug, Clone, Copy, Default)]
pub struct UpstreamBreakdown;

impl PriceBreakdown for UpstreamBreakdown {
    fn breakdown(&self, line: &EventLineItem) -> Result<LineAmounts, SettlementError> {
        let overflow = || invalid(line, "amount out of range");

        let unit_price = to_minor_units(line.unit_price_local).ok_or_else(overflow)?;
        let gross = to_minor_units(line.gross_local).ok_or_else(overflow)?;
        let fee = fee_minor_units(line.platform_fee_local).ok_or_else(overflow)?;
        let reported_net = to_minor_units(line.seller_net_local).ok_or_else(overflow)?;

        if reported_net < 0 {
            return Err(invalid(line, "negative amount"));
        }

        let amounts = split(line, unit_price, gross, fee)?;

        // one minor unit of slack for upstream rounding
        if (reported_net - amounts.net).abs() > 1 {
            return Err(invalid(
                line,
                format!(
                    "seller net {} does not match gross {} minus fee {}",
                    reported_net, amounts.gross, amounts.fee
                ),
            ));
        }

        Ok(amounts)
    }
}

/// Recomputes local prices from the USD price at a fixed rate
#[derive(Debug, Clone, Copy)]
pub struct FixedRateBreakdown {
    pub fee_rate: Decimal,
    pub conversion_rate: Decimal,
}

impl FixedRateBreakdown {
    pub fn new(fee_rate: Decimal, conversion_rate: Decimal) -> Self {
        Self {
            fee_rate,
            conversion_rate,
        }
    }
}

impl PriceBreakdown for FixedRateBreakdown {
    fn breakdown(&self, line: &EventLineItem) -> Result<LineAmounts, SettlementError> {
        let overflow = || invalid(line, "amount out of range");

        let unit_local = line
            .unit_price_usd
            .checked_mul(self.conversion_rate)
            .ok_or_else(overflow)?;
        let unit_price = to_minor_units(unit_local).ok_or_else(overflow)?;
        let gross = unit_price.checked_mul(line.quantity).ok_or_else(overflow)?;
        let fee = Decimal::from(gross)
            .checked_mul(self.fee_rate)
            .and_then(|fee| fee.floor().to_i64())
            .ok_or_else(overflow)?;

        split(line, unit_price, gross, fee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn line(gross: Decimal, fee: Decimal, net: Decimal) -> EventLineItem {
        EventLineItem {
            product_id: "p-1".into(),
            name: None,
            seller_id: "seller-a".into(),
            quantity: 1,
            unit_price_usd: dec!(0.18),
            unit_price_local: gross,
            gross_local: gross,
            platform_fee_local: fee,
            seller_net_local: net,
        }
    }

    #[test]
    fn test_minor_unit_rounding() {
        assert_eq!(to_minor_units(dec!(10.005)), Some(1001));
        assert_eq!(to_minor_units(dec!(10.004)), Some(1000));
        assert_eq!(fee_minor_units(dec!(1.009)), Some(100));
        assert_eq!(fee_minor_units(dec!(0.99999999999)), Some(100));
    }

    #[test]
    fn test_upstream_breakdown_keeps_totals_exact() {
        let amounts = UpstreamBreakdown
            .breakdown(&line(dec!(10.00), dec!(1.00), dec!(9.00)))
            .unwrap();
        assert_eq!(amounts.gross, 1000);
        assert_eq!(amounts.fee, 100);
        assert_eq!(amounts.net, 900);
        assert_eq!(amounts.gross, amounts.fee + amounts.net);
    }

    #[test]
    fn test_upstream_breakdown_absorbs_rounding_drift() {
        // fee floors to 33, net is the remainder 67; upstream reported 66
        let amounts = UpstreamBreakdown
            .breakdown(&line(dec!(1.00), dec!(0.335), dec!(0.66)))
            .unwrap();
        assert_eq!(amounts.fee, 33);
        assert_eq!(amounts.net, 67);
    }

    #[test]
    fn test_upstream_breakdown_rejects_mismatched_net() {
        let result = UpstreamBreakdown.breakdown(&line(dec!(10.00), dec!(1.00), dec!(5.00)));
        assert!(matches!(result, Err(SettlementError::InvalidLine { .. })));
    }

    #[test]
    fn test_rejects_negative_amounts() {
        let result = UpstreamBreakdown.breakdown(&line(dec!(-10.00), dec!(0), dec!(-10.00)));
        assert!(result.is_err());
    }

    #[test]
    fn test_oversized_amounts_are_invalid_lines() {
        let huge = Decimal::from_i128_with_scale(7 * 10_i128.pow(27), 0);
        assert_eq!(to_minor_units(huge), None);
        assert_eq!(fee_minor_units(huge), None);

        let result = UpstreamBreakdown.breakdown(&line(huge, dec!(0), huge));
        assert!(matches!(
            result,
            Err(SettlementError::InvalidLine { ref reason, .. }) if reason == "amount out of range"
        ));

        let pricing = FixedRateBreakdown::new(dec!(0.10), dec!(56));
        let mut item = line(dec!(0), dec!(0), dec!(0));
        item.unit_price_usd = huge;
        assert!(matches!(
            pricing.breakdown(&item),
            Err(SettlementError::InvalidLine { .. })
        ));
    }

    #[test]
    fn test_fixed_rate_breakdown() {
        let pricing = FixedRateBreakdown::new(dec!(0.10), dec!(56));
        let mut item = line(dec!(0), dec!(0), dec!(0));
        item.unit_price_usd = dec!(1.25);
        item.quantity = 2;

        let amounts = pricing.breakdown(&item).unwrap();
        assert_eq!(amounts.unit_price, 7000);
        assert_eq!(amounts.gross, 14000);
        assert_eq!(amounts.fee, 1400);
        assert_eq!(amounts.net, 12600);
    }
}
