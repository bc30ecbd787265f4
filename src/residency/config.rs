//! Residency manager configuration
//!
//! [`ResidencyConfig`] controls whether residency management runs at all,
//! how the OS budget is turned into the manager's own budget, and whether a
//! fixed test budget is applied at construction.

use serde::{Deserialize, Serialize};

use crate::config_error;
use crate::error::ResidencyResult;

/// Environment variable toggling residency management ("0"/"false" disables)
pub const RESIDENCY_ENABLED_ENV: &str = "RESFORGE_RESIDENCY_ENABLED";

/// Environment variable marking the adapter as unified-memory
pub const UMA_ENV: &str = "RESFORGE_UMA";

/// Environment variable overriding the budget cap ratio
pub const BUDGET_CAP_RATIO_ENV: &str = "RESFORGE_BUDGET_CAP_RATIO";

/// Environment variable restricting the budget to a fixed byte count
pub const RESTRICT_BUDGET_ENV: &str = "RESFORGE_RESTRICT_BUDGET";

/// Configuration for [`ResidencyManager`](super::ResidencyManager)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    /// When false every residency operation is a successful no-op
    pub enabled: bool,

    /// Unified-memory adapter: only the local segment is tracked
    pub is_uma: bool,

    /// Fraction of the OS budget (after external reservation) the manager
    /// allows itself. Leaving some budget unused damps fluctuations in the
    /// OS-defined budget.
    pub budget_cap_ratio: f64,

    /// Upper bound on an external reservation, as a fraction of the OS
    /// budget. At 1.0 a request is clamped to the OS budget only.
    pub max_external_reservation_ratio: f64,

    /// Fixed budget applied through `restrict_budget_for_testing` at construction
    pub restrict_budget: Option<u64>,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        ResidencyConfig {
            enabled: true,
            is_uma: false,
            budget_cap_ratio: 0.95,
            max_external_reservation_ratio: 1.0,
            restrict_budget: None,
        }
    }
}

impl ResidencyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from `RESFORGE_*` environment variables
    ///
    /// Unset variables keep their defaults; malformed values are rejected.
    pub fn from_env() -> ResidencyResult<Self> {
        let mut config = Self::default();

        if let Some(value) = read_env(RESIDENCY_ENABLED_ENV) {
            config.enabled = parse_bool(RESIDENCY_ENABLED_ENV, &value)?;
        }
        if let Some(value) = read_env(UMA_ENV) {
            config.is_uma = parse_bool(UMA_ENV, &value)?;
        }
        if let Some(value) = read_env(BUDGET_CAP_RATIO_ENV) {
            config.budget_cap_ratio = value.parse().map_err(|_| {
                config_error!("{}={:?} is not a number", BUDGET_CAP_RATIO_ENV, value)
            })?;
        }
        if let Some(value) = read_env(RESTRICT_BUDGET_ENV) {
            let bytes = value.parse().map_err(|_| {
                config_error!("{}={:?} is not a byte count", RESTRICT_BUDGET_ENV, value)
            })?;
            config.restrict_budget = Some(bytes);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_uma(mut self, is_uma: bool) -> Self {
        self.is_uma = is_uma;
        self
    }

    pub fn with_budget_cap_ratio(mut self, ratio: f64) -> Self {
        self.budget_cap_ratio = ratio;
        self
    }

    pub fn with_max_external_reservation_ratio(mut self, ratio: f64) -> Self {
        self.max_external_reservation_ratio = ratio;
        self
    }

    pub fn with_restricted_budget(mut self, budget: u64) -> Self {
        self.restrict_budget = Some(budget);
        self
    }

    /// Reject ratios outside `(0, 1]`
    pub fn validate(&self) -> ResidencyResult<()> {
        check_ratio("budget_cap_ratio", self.budget_cap_ratio)?;
        check_ratio(
            "max_external_reservation_ratio",
            self.max_external_reservation_ratio,
        )?;
        Ok(())
    }
}

fn check_ratio(name: &str, ratio: f64) -> ResidencyResult<()> {
    if ratio.is_finite() && ratio > 0.0 && ratio <= 1.0 {
        Ok(())
    } else {
        Err(config_error!("{} must be in (0, 1], got {}", name, ratio))
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(name: &str, value: &str) -> ResidencyResult<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(config_error!("{}={:?} is not a boolean", name, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ResidencyConfig::default();
        assert!(config.enabled);
        assert!(!config.is_uma);
        assert_eq!(config.budget_cap_ratio, 0.95);
        assert_eq!(config.max_external_reservation_ratio, 1.0);
        assert_eq!(config.restrict_budget, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ResidencyConfig::new()
            .with_enabled(false)
            .with_uma(true)
            .with_budget_cap_ratio(0.8)
            .with_max_external_reservation_ratio(0.25)
            .with_restricted_budget(1 << 20);

        assert!(!config.enabled);
        assert!(config.is_uma);
        assert_eq!(config.budget_cap_ratio, 0.8);
        assert_eq!(config.max_external_reservation_ratio, 0.25);
        assert_eq!(config.restrict_budget, Some(1 << 20));
    }

    #[test]
    fn test_invalid_ratios() {
        for ratio in [0.0, -0.5, 1.5, f64::NAN, f64::INFINITY] {
            let config = ResidencyConfig::new().with_budget_cap_ratio(ratio);
            assert!(config.validate().is_err(), "ratio {} accepted", ratio);
        }
        let config = ResidencyConfig::new().with_max_external_reservation_ratio(2.0);
        assert!(config.validate().unwrap_err().is_user_error());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("X", "TRUE").unwrap());
        assert!(parse_bool("X", "on").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: ResidencyConfig =
            serde_json::from_str(r#"{"is_uma": true, "restrict_budget": 4096}"#).unwrap();
        assert!(config.enabled);
        assert!(config.is_uma);
        assert_eq!(config.restrict_budget, Some(4096));
        assert_eq!(config.budget_cap_ratio, 0.95);
    }
}
