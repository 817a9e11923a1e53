use super::FinanceError;
use crate::store::types::{PercentileTimeSeries, TimeSeriesPoint};

/// Per-year coverage of an obligation (debt service, interest, ...) by a cash measure.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageRatios {
    pub per_year: Vec<TimeSeriesPoint>,
    pub min: f64,
    pub avg: f64,
}

/// Computes DSCR-style ratios over operational years only.
///
/// A year counts when `year >= first_operational_year`, both series carry it,
/// and the obligation magnitude is non-zero.
pub fn coverage_ratios(
    cashflow: &PercentileTimeSeries,
    obligation: &PercentileTimeSeries,
    first_operational_year: u32,
) -> Result<CoverageRatios, FinanceError> {
    let per_year: Vec<TimeSeriesPoint> = obligation
        .points
        .iter()
        .filter(|o| o.year >= first_operational_year && o.value != 0.0)
        .filter_map(|o| cashflow.value_at(o.year).map(|cf| TimeSeriesPoint::new(o.year, cf / o.value.abs())))
        .collect();

    if per_year.is_empty() {
        return Err(FinanceError::NoEligibleYears("coverage ratio"));
    }

    let min = per_year.iter().map(|p| p.value).fold(f64::INFINITY, f64::min);
    let avg = per_year.iter().map(|p| p.value).sum::<f64>() / per_year.len() as f64;
    Ok(CoverageRatios { per_year, min, avg })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[f64]) -> PercentileTimeSeries {
        PercentileTimeSeries::new(50, values.iter().enumerate().map(|(y, &v)| TimeSeriesPoint::new(y as u32, v)).collect())
    }

    #[test]
    fn test_construction_years_are_excluded() {
        // Year 0 is construction: huge negative cash, no real coverage meaning.
        let cfads = series(&[-500.0, 130.0, 150.0, 120.0]);
        let debt = series(&[100.0, 100.0, 100.0, 100.0]);
        let ratios = coverage_ratios(&cfads, &debt, 1).unwrap();
        assert_eq!(ratios.per_year.len(), 3);
        assert!((ratios.min - 1.2).abs() < 1e-12);
        assert!((ratios.avg - (1.3 + 1.5 + 1.2) / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_obligation_years_are_skipped_and_sign_ignored() {
        let cfads = series(&[0.0, 120.0, 150.0, 90.0]);
        let debt = series(&[0.0, -100.0, 0.0, -100.0]);
        let ratios = coverage_ratios(&cfads, &debt, 1).unwrap();
        let years: Vec<u32> = ratios.per_year.iter().map(|p| p.year).collect();
        assert_eq!(years, vec![1, 3]);
        assert!((ratios.min - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_no_eligible_years_is_an_error() {
        let cfads = series(&[10.0]);
        let debt = series(&[5.0]);
        assert_eq!(coverage_ratios(&cfads, &debt, 1), Err(FinanceError::NoEligibleYears("coverage ratio")));
    }
}
