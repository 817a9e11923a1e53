//! Numerically guarded cash-flow mathematics used by analytical metrics.
//!
//! All functions take year-indexed points rather than positional vectors, so
//! gaps in a series never shift the discounting of later years.
pub mod coverage;
pub mod irr;
pub mod npv;
pub mod payback;

pub use coverage::{coverage_ratios, CoverageRatios};
pub use irr::{irr, IrrOutcome};
pub use npv::{npv, npv_and_derivative};
pub use payback::{payback_period, PaybackOutcome};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FinanceError {
    #[error("Discount rate {0} must be greater than -100%")]
    InvalidRate(f64),
    #[error("No eligible years to compute {0}")]
    NoEligibleYears(&'static str),
    #[error("IRR did not converge after {iterations} iterations (residual NPV {residual:.6})")]
    NonConvergence { iterations: u32, residual: f64 },
}
