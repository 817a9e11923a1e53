use crate::store::types::TimeSeriesPoint;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaybackOutcome {
    pub years: f64,
    /// False when cumulative cash never turned positive and `years` is the horizon.
    pub recovered: bool,
}

/// Walks cumulative cash by ascending year and interpolates the crossing.
///
/// The fractional year is linear between the last non-positive cumulative
/// point and the first positive one.
pub fn payback_period(cashflows: &[TimeSeriesPoint], horizon: f64) -> PaybackOutcome {
    let mut points = cashflows.to_vec();
    points.sort_by_key(|p| p.year);

    let mut cumulative = 0.0;
    let mut previous: Option<(u32, f64)> = None;

    for p in &points {
        cumulative += p.value;
        if cumulative > 0.0 {
            let years = match previous {
                Some((prev_year, prev_cum)) => {
                    let span = (p.year - prev_year) as f64;
                    prev_year as f64 + span * (-prev_cum) / (cumulative - prev_cum)
                }
                // Positive from the very first point.
                None => p.year as f64,
            };
            return PaybackOutcome { years, recovered: true };
        }
        previous = Some((p.year, cumulative));
    }

    PaybackOutcome { years: horizon, recovered: false }
}
