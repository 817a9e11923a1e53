//! Element-wise series kernels shared by transformers and multipliers.
use crate::store::types::{MultiplierOp, PercentileTimeSeries, TimeSeriesPoint};
use std::collections::BTreeMap;

/// Broadcasts a scalar to every year `1..=project_life` of every percentile.
pub fn expand_scalar(value: f64, percentiles: &[u32], project_life: u32) -> Vec<PercentileTimeSeries> {
    let points: Vec<TimeSeriesPoint> = (1..=project_life).map(|y| TimeSeriesPoint::new(y, value)).collect();
    percentiles.iter().map(|&p| PercentileTimeSeries { percentile: p, points: points.clone() }).collect()
}

/// Copies a percentile-free series to every percentile.
pub fn replicate_series(points: &[TimeSeriesPoint], percentiles: &[u32]) -> Vec<PercentileTimeSeries> {
    percentiles.iter().map(|&p| PercentileTimeSeries::new(p, points.to_vec())).collect()
}

/// Right-hand side of a multiplier, already taken at the series' percentile.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    Scalar(f64),
    Series(&'a PercentileTimeSeries),
}

impl Operand<'_> {
    fn at(&self, year: u32) -> Option<f64> {
        match self {
            Operand::Scalar(v) => Some(*v),
            Operand::Series(s) => s.value_at(year),
        }
    }
}

/// Applies one multiplier in place and returns the years left unadjusted
/// because the operand had no value for them.
///
/// `Summation` is not handled here; see [`sum_series`].
pub fn apply_multiplier(series: &mut PercentileTimeSeries, op: MultiplierOp, operand: Operand<'_>, base_year: u32) -> Vec<u32> {
    let mut skipped = Vec::new();
    for point in &mut series.points {
        let Some(x) = operand.at(point.year) else {
            skipped.push(point.year);
            continue;
        };
        let n = point.year as f64 - base_year as f64;
        match op {
            MultiplierOp::Multiply => point.value *= x,
            MultiplierOp::Compound => point.value *= (1.0 + x).powf(n),
            MultiplierOp::Simple => point.value *= 1.0 + x * n,
            MultiplierOp::Summation => {}
        }
    }
    skipped
}

/// Year-wise sum over the union of years of all members.
pub fn sum_series<'a>(percentile: u32, members: impl IntoIterator<Item = &'a PercentileTimeSeries>) -> PercentileTimeSeries {
    let mut acc: BTreeMap<u32, f64> = BTreeMap::new();
    for s in members {
        for p in &s.points {
            *acc.entry(p.year).or_insert(0.0) += p.value;
        }
    }
    PercentileTimeSeries {
        percentile,
        points: acc.into_iter().map(|(y, v)| TimeSeriesPoint::new(y, v)).collect(),
    }
}

/// First member minus every following member, over the union of years.
pub fn net_series<'a>(percentile: u32, members: impl IntoIterator<Item = &'a PercentileTimeSeries>) -> PercentileTimeSeries {
    let mut acc: BTreeMap<u32, f64> = BTreeMap::new();
    for (i, s) in members.into_iter().enumerate() {
        let sign = if i == 0 { 1.0 } else { -1.0 };
        for p in &s.points {
            *acc.entry(p.year).or_insert(0.0) += sign * p.value;
        }
    }
    PercentileTimeSeries {
        percentile,
        points: acc.into_iter().map(|(y, v)| TimeSeriesPoint::new(y, v)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn flat(value: f64, years: u32) -> PercentileTimeSeries { expand_scalar(value, &[50], years).remove(0) }

    #[test]
    fn test_expand_scalar_covers_every_year_and_percentile() {
        let out = expand_scalar(2.0, &[10, 50, 90], 3);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|s| s.points.len() == 3 && s.total() == 6.0));
        assert_eq!(out[2].percentile, 90);
        assert_eq!(out[0].points[0].year, 1);
    }

    #[rstest]
    #[case(MultiplierOp::Compound, 0.05, 0, 10)]
    #[case(MultiplierOp::Compound, 0.02, 3, 25)]
    #[case(MultiplierOp::Simple, 0.05, 0, 10)]
    #[case(MultiplierOp::Simple, 0.03, 2, 20)]
    fn test_escalation_laws(#[case] op: MultiplierOp, #[case] rate: f64, #[case] base: u32, #[case] life: u32) {
        let mut s = flat(100.0, life);
        apply_multiplier(&mut s, op, Operand::Scalar(rate), base);
        for p in &s.points {
            let n = p.year as f64 - base as f64;
            let expected = match op {
                MultiplierOp::Compound => 100.0 * (1.0 + rate).powf(n),
                _ => 100.0 * (1.0 + rate * n),
            };
            assert!((p.value - expected).abs() < 1e-9, "year {}: {} vs {}", p.year, p.value, expected);
        }
    }

    #[rstest]
    #[case(MultiplierOp::Compound)]
    #[case(MultiplierOp::Simple)]
    fn test_zero_rate_is_identity(#[case] op: MultiplierOp) {
        let mut s = flat(42.0, 15);
        apply_multiplier(&mut s, op, Operand::Scalar(0.0), 4);
        assert!(s.points.iter().all(|p| p.value == 42.0));
    }

    #[test]
    fn test_multiply_by_series_skips_missing_years() {
        let mut s = flat(10.0, 3);
        let factor = PercentileTimeSeries::new(50, vec![TimeSeriesPoint::new(1, 2.0), TimeSeriesPoint::new(3, 0.5)]);
        let skipped = apply_multiplier(&mut s, MultiplierOp::Multiply, Operand::Series(&factor), 0);
        assert_eq!(skipped, vec![2]);
        assert_eq!(s.points.iter().map(|p| p.value).collect::<Vec<_>>(), vec![20.0, 10.0, 5.0]);
    }

    #[test]
    fn test_sum_and_net_over_year_union() {
        let a = PercentileTimeSeries::new(50, vec![TimeSeriesPoint::new(1, 10.0), TimeSeriesPoint::new(2, 10.0)]);
        let b = PercentileTimeSeries::new(50, vec![TimeSeriesPoint::new(2, 4.0), TimeSeriesPoint::new(3, 1.0)]);

        let sum = sum_series(50, [&a, &b]);
        assert_eq!(sum.points, vec![
            TimeSeriesPoint::new(1, 10.0),
            TimeSeriesPoint::new(2, 14.0),
            TimeSeriesPoint::new(3, 1.0),
        ]);

        let net = net_series(50, [&a, &b]);
        assert_eq!(net.value_at(2), Some(6.0));
        assert_eq!(net.value_at(3), Some(-1.0));
        assert!(sum_series(50, std::iter::empty()).is_empty());
    }
}
