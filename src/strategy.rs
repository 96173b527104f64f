// =============================================================================
// Strategy registry
// =============================================================================
//
// Maps the strategy names accepted by the control surface onto the signal
// pipeline. Both scalping variants share the same entry rule; they differ
// only in the parameter set the caller supplies.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    #[serde(rename = "scalping-lp")]
    ScalpingLp,
    #[serde(rename = "scalping-lp-v2")]
    ScalpingLpV2,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 2] = [StrategyKind::ScalpingLp, StrategyKind::ScalpingLpV2];

    /// Resolve a strategy name (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self, ControlError> {
        match name.trim().to_lowercase().as_str() {
            "scalping-lp" => Ok(Self::ScalpingLp),
            "scalping-lp-v2" => Ok(Self::ScalpingLpV2),
            _ => Err(ControlError::UnknownStrategy(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ScalpingLp => "scalping-lp",
            Self::ScalpingLpV2 => "scalping-lp-v2",
        }
    }

    /// Names of every registered strategy.
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|k| k.name()).collect()
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_names_case_insensitively() {
        assert_eq!(StrategyKind::from_name("scalping-lp").unwrap(), StrategyKind::ScalpingLp);
        assert_eq!(
            StrategyKind::from_name("Scalping-LP-V2").unwrap(),
            StrategyKind::ScalpingLpV2
        );
        assert_eq!(StrategyKind::names(), vec!["scalping-lp", "scalping-lp-v2"]);
    }

    #[test]
    fn unknown_name_is_rejected() {
        match StrategyKind::from_name("martingale") {
            Err(ControlError::UnknownStrategy(name)) => assert_eq!(name, "martingale"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
