use super::FinanceError;
use crate::store::types::TimeSeriesPoint;

/// `Σ value / (1 + rate)^year`. Year 0 is undiscounted.
pub fn npv(cashflows: &[TimeSeriesPoint], rate: f64) -> Result<f64, FinanceError> {
    if !rate.is_finite() || rate <= -1.0 {
        return Err(FinanceError::InvalidRate(rate));
    }
    Ok(npv_and_derivative(cashflows, rate).0)
}

/// NPV together with its analytic derivative with respect to the rate.
#[inline]
pub fn npv_and_derivative(cashflows: &[TimeSeriesPoint], rate: f64) -> (f64, f64) {
    let base = 1.0 + rate;
    cashflows.iter().fold((0.0, 0.0), |(value, slope), p| {
        let t = p.year as f64;
        let discount = base.powf(t);
        (value + p.value / discount, slope - t * p.value / (discount * base))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flows(values: &[f64]) -> Vec<TimeSeriesPoint> {
        values.iter().enumerate().map(|(y, &v)| TimeSeriesPoint::new(y as u32, v)).collect()
    }

    #[test]
    fn test_zero_rate_is_plain_sum() {
        let cf = flows(&[-100.0, 30.0, 40.0, 50.0]);
        assert_eq!(npv(&cf, 0.0).unwrap(), 20.0);
    }

    #[test]
    fn test_discounting_uses_year_not_position() {
        let gapped = vec![TimeSeriesPoint::new(0, -100.0), TimeSeriesPoint::new(2, 121.0)];
        assert!((npv(&gapped, 0.1).unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_rate_at_or_below_minus_one_is_rejected() {
        assert_eq!(npv(&flows(&[1.0]), -1.0), Err(FinanceError::InvalidRate(-1.0)));
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let cf = flows(&[-100.0, 20.0, 60.0, 70.0]);
        let (_, d) = npv_and_derivative(&cf, 0.08);
        let h = 1e-6;
        let numeric = (npv_and_derivative(&cf, 0.08 + h).0 - npv_and_derivative(&cf, 0.08 - h).0) / (2.0 * h);
        assert!((d - numeric).abs() < 1e-4);
    }
}
