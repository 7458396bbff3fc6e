use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Scope a propagation may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum UpdateLevel {
    #[default]
    Show,
    Season,
}

/// Which episodes inside the scope are targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum UpdateStrategy {
    All,
    #[default]
    Next,
}

impl FromStr for UpdateLevel {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "show" => Ok(UpdateLevel::Show),
            "season" => Ok(UpdateLevel::Season),
            _ => Err(ModelError::InvalidPolicy {
                field: "update_level",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for UpdateStrategy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(UpdateStrategy::All),
            "next" => Ok(UpdateStrategy::Next),
            _ => Err(ModelError::InvalidPolicy {
                field: "update_strategy",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for UpdateLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateLevel::Show => f.write_str("show"),
            UpdateLevel::Season => f.write_str("season"),
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStrategy::All => f.write_str("all"),
            UpdateStrategy::Next => f.write_str("next"),
        }
    }
}
