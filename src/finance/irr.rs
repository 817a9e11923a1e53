//! Newton–Raphson IRR with damping and iteration-dependent rate bounds.
use super::npv::npv_and_derivative;
use crate::store::types::TimeSeriesPoint;

const MAX_ITERATIONS: u32 = 150;
const NPV_TOLERANCE: f64 = 1e-6;
const STEP_TOLERANCE: f64 = 1e-10;
const DAMPING: f64 = 0.5;

const GUESS_FLOOR: f64 = 0.001;
const GUESS_CEILING: f64 = 0.80;

// Per-iteration bounds move from the START pair to the END pair.
const LOWER_START: f64 = -0.95;
const LOWER_END: f64 = -0.99;
const UPPER_START: f64 = 5.0;
const UPPER_END: f64 = 2.0;

const RESULT_FLOOR: f64 = -0.95;
const RESULT_CEILING: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IrrOutcome {
    pub rate: f64,
    pub iterations: u32,
    pub converged: bool,
    /// The final rate fell outside [-95%, 1000%] and was clamped.
    pub clamped: bool,
    /// Cash flows lacked a sign change; `rate` is 0 by convention.
    pub degenerate: bool,
    pub residual: f64,
}

/// Internal rate of return of year-indexed cash flows.
///
/// Requires at least one negative and one positive entry; otherwise the
/// degenerate outcome with rate 0 is returned.
pub fn irr(cashflows: &[TimeSeriesPoint]) -> IrrOutcome {
    let inflows: f64 = cashflows.iter().filter(|p| p.value > 0.0).map(|p| p.value).sum();
    let outflows: f64 = cashflows.iter().filter(|p| p.value < 0.0).map(|p| -p.value).sum();

    if inflows <= 0.0 || outflows <= 0.0 {
        return IrrOutcome { rate: 0.0, iterations: 0, converged: false, clamped: false, degenerate: true, residual: 0.0 };
    }

    let mut rate = initial_guess(cashflows, inflows, outflows);
    let mut previous_abs = f64::INFINITY;
    let mut residual = f64::INFINITY;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < MAX_ITERATIONS {
        let (value, slope) = npv_and_derivative(cashflows, rate);
        residual = value;
        if value.abs() < NPV_TOLERANCE {
            converged = true;
            break;
        }
        if slope == 0.0 || !slope.is_finite() || !value.is_finite() {
            break;
        }

        let mut step = value / slope;
        if value.abs() > previous_abs {
            step *= DAMPING;
        }
        previous_abs = value.abs();

        let (lower, upper) = bounds_at(iterations);
        let next = (rate - step).clamp(lower, upper);
        iterations += 1;

        if (next - rate).abs() < STEP_TOLERANCE {
            rate = next;
            residual = npv_and_derivative(cashflows, rate).0;
            converged = residual.abs() < NPV_TOLERANCE * outflows.max(1.0);
            break;
        }
        rate = next;
    }

    let clamped = !(RESULT_FLOOR..=RESULT_CEILING).contains(&rate);
    IrrOutcome {
        rate: rate.clamp(RESULT_FLOOR, RESULT_CEILING),
        iterations,
        converged,
        clamped,
        degenerate: false,
        residual,
    }
}

/// `(Σinflows / Σoutflows)^(1 / averageInflowYear) - 1`, clamped to [0.1%, 80%].
fn initial_guess(cashflows: &[TimeSeriesPoint], inflows: f64, outflows: f64) -> f64 {
    let weighted_year: f64 = cashflows
        .iter()
        .filter(|p| p.value > 0.0)
        .map(|p| p.year as f64 * p.value)
        .sum::<f64>()
        / inflows;
    let horizon = if weighted_year > 0.0 { weighted_year } else { 1.0 };
    let guess = (inflows / outflows).powf(1.0 / horizon) - 1.0;
    if guess.is_finite() { guess.clamp(GUESS_FLOOR, GUESS_CEILING) } else { GUESS_FLOOR }
}

fn bounds_at(iteration: u32) -> (f64, f64) {
    let progress = iteration as f64 / MAX_ITERATIONS as f64;
    (
        LOWER_START + (LOWER_END - LOWER_START) * progress,
        UPPER_START + (UPPER_END - UPPER_START) * progress,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn flows(values: &[f64]) -> Vec<TimeSeriesPoint> {
        values.iter().enumerate().map(|(y, &v)| TimeSeriesPoint::new(y as u32, v)).collect()
    }

    #[rstest]
    #[case(&[-100.0, 110.0], 0.10)]
    #[case(&[-1000.0, 300.0, 300.0, 300.0, 300.0, 300.0], 0.152382)]
    #[case(&[-100.0, 0.0, 121.0], 0.10)]
    #[case(&[-100.0, 50.0, 40.0], -0.069926)]
    fn test_irr_known_values(#[case] values: &[f64], #[case] expected: f64) {
        let out = irr(&flows(values));
        assert!(out.converged, "{:?}", out);
        assert!((out.rate - expected).abs() < 1e-4, "got {}, expected {}", out.rate, expected);
        assert!(!out.clamped);
    }

    #[test]
    fn test_irr_simple_ten_percent_within_tolerance() {
        let out = irr(&flows(&[-100.0, 110.0]));
        assert!((out.rate - 0.10).abs() <= 0.01);
    }

    #[rstest]
    #[case(&[100.0, 50.0])]
    #[case(&[-100.0, -50.0])]
    #[case(&[])]
    fn test_degenerate_cashflows_return_zero(#[case] values: &[f64]) {
        let out = irr(&flows(values));
        assert!(out.degenerate);
        assert_eq!(out.rate, 0.0);
    }

    #[test]
    fn test_ill_posed_cashflow_is_clamped_and_flagged() {
        // True IRR is -99%, below the result floor.
        let out = irr(&flows(&[-100.0, 1.0]));
        assert!(out.clamped);
        assert_eq!(out.rate, RESULT_FLOOR);
    }

    #[test]
    fn test_bounds_tighten_over_iterations() {
        assert_eq!(bounds_at(0), (LOWER_START, UPPER_START));
        let (lo, hi) = bounds_at(MAX_ITERATIONS);
        assert!((lo - LOWER_END).abs() < 1e-12 && (hi - UPPER_END).abs() < 1e-12);
    }
}
