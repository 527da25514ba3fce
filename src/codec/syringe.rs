//! Syringe diameter → maximum pumping rate.
//!
//! The pump's maximum plunger speed is fixed, so the maximum volumetric rate
//! grows with the syringe cross-section.  The table below follows the rate
//! limits in the NE-4000 manual for common syringes (1 mL through 60 mL BD
//! plastic) plus the diameter range extremes.  Used only for a pre-flight
//! warning; the pump rejects out-of-range rates itself.

/// `(inner diameter mm, max rate µL/min)`, sorted by diameter.
const MAX_RATE_TABLE: [(f64, f64); 10] = [
    (0.1, 0.4),
    (1.0, 40.05),
    (4.699, 884.4),
    (8.585, 2951.8),
    (11.99, 5757.6),
    (14.43, 8339.3),
    (19.13, 14656.7),
    (26.59, 28316.6),
    (35.0, 49061.3),
    (50.0, 100_125.0),
];

/// Piecewise-linear interpolation over [`MAX_RATE_TABLE`], clamped at both
/// ends.
pub fn max_rate_for_diameter(diameter_mm: f64) -> f64 {
    let first = MAX_RATE_TABLE[0];
    let last = MAX_RATE_TABLE[MAX_RATE_TABLE.len() - 1];
    if diameter_mm <= first.0 {
        return first.1;
    }
    if diameter_mm >= last.0 {
        return last.1;
    }
    for pair in MAX_RATE_TABLE.windows(2) {
        let (d0, r0) = pair[0];
        let (d1, r1) = pair[1];
        if diameter_mm <= d1 {
            let t = (diameter_mm - d0) / (d1 - d0);
            return r0 + t * (r1 - r0);
        }
    }
    last.1
}
