//! Scenario-level scalars supplied by the caller.
//!
//! Settings come either from code or from a TOML file layered with
//! `WINDCAST_*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

fn default_currency() -> String { "EUR".to_string() }

fn default_first_operational_year() -> u32 { 1 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub available_percentiles: Vec<u32>,
    pub primary_percentile: u32,
    pub project_life: u32,
    #[serde(default)]
    pub num_wtgs: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// First year counted as operational by coverage ratios; earlier years are construction.
    #[serde(default = "default_first_operational_year")]
    pub first_operational_year: u32,
}

impl EngineSettings {
    pub fn new(available_percentiles: Vec<u32>, primary_percentile: u32, project_life: u32) -> Self {
        Self {
            available_percentiles,
            primary_percentile,
            project_life,
            num_wtgs: 0.0,
            currency: default_currency(),
            first_operational_year: default_first_operational_year(),
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |msg: String| Err(SettingsError::Invalid(msg));

        if self.available_percentiles.is_empty() {
            return invalid("available_percentiles is empty".into());
        }
        let mut seen = HashSet::new();
        for &p in &self.available_percentiles {
            if !(1..=99).contains(&p) {
                return invalid(format!("percentile {} outside 1..=99", p));
            }
            if !seen.insert(p) {
                return invalid(format!("percentile {} listed twice", p));
            }
        }
        if !seen.contains(&self.primary_percentile) {
            return invalid(format!("primary percentile {} is not available", self.primary_percentile));
        }
        if self.project_life == 0 {
            return invalid("project_life must be at least 1".into());
        }
        if !self.num_wtgs.is_finite() || self.num_wtgs < 0.0 {
            return invalid(format!("num_wtgs {} must be a non-negative number", self.num_wtgs));
        }
        Ok(())
    }
}

/// Loads and validates settings from `path` overlaid with `WINDCAST_*` variables.
pub fn load_settings(path: &Path) -> Result<EngineSettings, SettingsError> {
    let builder = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(
            config::Environment::with_prefix("WINDCAST")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("available_percentiles"),
        )
        .build()?;

    let settings = builder.try_deserialize::<EngineSettings>()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_toml_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "available_percentiles = [10, 50, 90]\nprimary_percentile = 50\nproject_life = 25\nnum_wtgs = 12.0"
        )
        .unwrap();

        let settings = load_settings(file.path()).unwrap();
        assert_eq!(settings.available_percentiles, vec![10, 50, 90]);
        assert_eq!(settings.currency, "EUR");
        assert_eq!(settings.first_operational_year, 1);
        assert_eq!(settings.num_wtgs, 12.0);
    }

    #[test]
    fn test_invalid_settings_fail_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "available_percentiles = [10, 90]\nprimary_percentile = 50\nproject_life = 25").unwrap();
        assert!(matches!(load_settings(file.path()), Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_validation_rules() {
        assert!(EngineSettings::new(vec![50], 50, 20).validate().is_ok());
        assert!(EngineSettings::new(vec![], 50, 20).validate().is_err());
        assert!(EngineSettings::new(vec![0, 50], 50, 20).validate().is_err());
        assert!(EngineSettings::new(vec![50, 50], 50, 20).validate().is_err());
        assert!(EngineSettings::new(vec![50], 50, 0).validate().is_err());

        let mut negative = EngineSettings::new(vec![50], 50, 20);
        negative.num_wtgs = -1.0;
        assert!(negative.validate().is_err());
    }
}
