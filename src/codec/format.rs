//! Numeric field formatting.
//!
//! The pump accepts at most four digits per numeric field.  Each formatter
//! picks a decimal precision from the value's magnitude band, then drops
//! decimals if rounding pushed the result over the limit (e.g. `99.996`
//! would otherwise round to `100.00`).

use super::units::{RateUnit, VolumeUnit};

/// Maximum number of digits the firmware accepts in a numeric field.
pub const MAX_DIGITS: usize = 4;

/// Largest rate expressed in µL/min before switching to mL/min.
const MAX_UL_RATE: f64 = 9999.0;

/// Fastest rate a four-digit field can carry (9999 mL/min).
pub const MAX_RATE_UL_MIN: f64 = 9_999_000.0;

fn digit_count(s: &str) -> usize {
    s.bytes().filter(u8::is_ascii_digit).count()
}

fn fit_digits(value: f64, decimals: usize) -> String {
    let mut decimals = decimals;
    loop {
        let s = format!("{value:.decimals$}");
        if digit_count(&s) <= MAX_DIGITS || decimals == 0 {
            return s;
        }
        decimals -= 1;
    }
}

/// Format a flow rate, auto-converting µL to mL when the value would not fit.
///
/// Returns the formatted number and the unit it must be sent with.  Rates
/// above [`MAX_RATE_UL_MIN`] come out five digits wide; the driver and the
/// config validators reject them before they get here.
pub fn format_rate(value: f64, unit: RateUnit) -> (String, RateUnit) {
    let value = value.max(0.0);
    let (value, unit) = match unit {
        RateUnit::UlPerMin if value > MAX_UL_RATE => (value / 1000.0, RateUnit::MlPerMin),
        RateUnit::UlPerHour if value > MAX_UL_RATE => (value / 1000.0, RateUnit::MlPerHour),
        other => (value, other),
    };
    let decimals = if value >= 1000.0 {
        0
    } else if value >= 100.0 {
        1
    } else {
        2
    };
    (fit_digits(value, decimals), unit)
}

/// Format a volume in mL: `>=100` one decimal, `>=10` two, otherwise three.
pub fn format_volume_ml(value: f64) -> String {
    let value = value.max(0.0);
    let decimals = if value >= 100.0 {
        1
    } else if value >= 10.0 {
        2
    } else {
        3
    };
    fit_digits(value, decimals)
}

/// Format a volume in µL: `>=1000` no decimals, `>=100` one, otherwise two.
pub fn format_volume_ul(value: f64) -> String {
    let value = value.max(0.0);
    let decimals = if value >= 1000.0 {
        0
    } else if value >= 100.0 {
        1
    } else {
        2
    };
    fit_digits(value, decimals)
}

/// Format a volume already expressed in `unit`.
pub fn format_volume(value: f64, unit: VolumeUnit) -> String {
    match unit {
        VolumeUnit::Ml => format_volume_ml(value),
        VolumeUnit::Ul => format_volume_ul(value),
    }
}

/// Format a syringe inner diameter in mm (`26.59`, `4.699`).
pub fn format_diameter(diameter_mm: f64) -> String {
    let d = diameter_mm.max(0.0);
    fit_digits(d, if d >= 10.0 { 2 } else { 3 })
}
