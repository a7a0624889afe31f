//! Scenario Definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The driving scenarios a capture session cycles through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioName {
    ColdStart,
    Idle,
    VaryingRpm,
    Hydraulics,
    Pto,
}

impl ScenarioName {
    /// Stable stem used for per-scenario output files
    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::ColdStart => "cold_start",
            Self::Idle => "idle",
            Self::VaryingRpm => "varying_rpm",
            Self::Hydraulics => "hydraulics",
            Self::Pto => "pto",
        }
    }

    /// Instruction shown to the operator before the scenario starts
    pub fn operator_instructions(&self) -> &'static str {
        match self {
            Self::ColdStart => "Start the engine from cold and let it idle",
            Self::Idle => "Let the engine idle at operating temperature",
            Self::VaryingRpm => "Vary engine speed across the usable RPM range",
            Self::Hydraulics => "Operate the hydraulic loader and three-point hitch",
            Self::Pto => "Engage the PTO under light load",
        }
    }
}

impl fmt::Display for ScenarioName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// One scenario in the session plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: ScenarioName,
    /// Nominal capture duration at full cadence
    pub duration: Duration,
    /// Block on the operator gate before sampling starts
    pub requires_operator_prompt: bool,
}

impl ScenarioSpec {
    pub fn new(name: ScenarioName, duration: Duration) -> Self {
        Self {
            name,
            duration,
            requires_operator_prompt: true,
        }
    }

    /// The standard field plan: warm-up first, short PTO run last
    pub fn standard_plan() -> Vec<ScenarioSpec> {
        vec![
            Self::new(ScenarioName::ColdStart, Duration::from_secs(300)),
            Self::new(ScenarioName::Idle, Duration::from_secs(120)),
            Self::new(ScenarioName::VaryingRpm, Duration::from_secs(120)),
            Self::new(ScenarioName::Hydraulics, Duration::from_secs(120)),
            Self::new(ScenarioName::Pto, Duration::from_secs(30)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_plan_order_and_durations() {
        let plan = ScenarioSpec::standard_plan();
        let names: Vec<ScenarioName> = plan.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                ScenarioName::ColdStart,
                ScenarioName::Idle,
                ScenarioName::VaryingRpm,
                ScenarioName::Hydraulics,
                ScenarioName::Pto,
            ]
        );
        assert_eq!(plan[0].duration, Duration::from_secs(300));
        assert_eq!(plan[4].duration, Duration::from_secs(30));
        assert!(plan.iter().all(|s| s.requires_operator_prompt));
    }

    #[test]
    fn test_file_stems_are_snake_case() {
        assert_eq!(ScenarioName::VaryingRpm.file_stem(), "varying_rpm");
        assert_eq!(ScenarioName::ColdStart.to_string(), "cold_start");
    }
}
