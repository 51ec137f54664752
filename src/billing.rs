//! Consumption based billing derived from meter and billing history
use rust_decimal::Decimal;
use std::fmt;

use crate::account::{Amount, BillingEntry, MeterReading};
use crate::error::AmountOverflow;

pub const CURRENCY_SYMBOL: &str = "£";

/// How the amount of a new billing entry is arrived at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Charge for the units consumed since the last bill at the supplier's tariff.
    /// Any caller supplied amount is ignored.
    Standard { description: Option<String> },
    /// A manual charge or credit.
    Adjust { description: String, amount: Amount },
}

/// Price per metered unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Tariff(Decimal);

impl Tariff {
    pub fn per_unit(price: Decimal) -> Self {
        Self(price)
    }
    pub fn price(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Tariff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", CURRENCY_SYMBOL, self.0)
    }
}

/// The derived charge for one standard bill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionCharge {
    pub units_consumed: u64,
    pub amount: Amount,
    pub description: String,
}

/// Units consumed between the last bill and the latest reading.
///
/// Readings strictly after the last bill belong to the new period; the reading
/// just before them is the baseline. A reading taken at exactly the bill time
/// counts as the baseline, not as new consumption.
pub fn units_since_last_bill(meter_readings: &[MeterReading], billing_entries: &[BillingEntry]) -> u64 {
    let Some(latest) = meter_readings.last() else {
        return 0;
    };
    let Some(last_bill) = billing_entries.last() else {
        return latest.units;
    };

    if latest.timestamp < last_bill.timestamp {
        return 0;
    }

    let mut first_after_bill = meter_readings.len() - 1;
    while first_after_bill > 0 && meter_readings[first_after_bill - 1].timestamp > last_bill.timestamp {
        first_after_bill -= 1;
    }

    match first_after_bill.checked_sub(1) {
        Some(baseline) => latest.units.saturating_sub(meter_readings[baseline].units),
        None => latest.units,
    }
}

/// Derives the amount and narrative of a standard bill.
pub fn derive_consumption_charge(
    meter_readings: &[MeterReading],
    billing_entries: &[BillingEntry],
    tariff: Tariff,
    description: Option<&str>,
) -> Result<ConsumptionCharge, AmountOverflow> {
    let units_consumed = units_since_last_bill(meter_readings, billing_entries);
    let amount = Decimal::from(units_consumed)
        .checked_mul(tariff.price())
        .map(|price| Amount::new(price).round_to_minor())
        .ok_or(AmountOverflow)?;

    let suffix = format!("{} units @ {}", units_consumed, tariff);
    let description = match description.map(str::trim) {
        Some(text) if !text.is_empty() => format!("{} {}", text, suffix),
        _ => suffix,
    };

    Ok(ConsumptionCharge {
        units_consumed,
        amount,
        description,
    })
}
