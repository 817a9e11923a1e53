pub mod telemetry;
pub mod topology;
pub mod validation;
