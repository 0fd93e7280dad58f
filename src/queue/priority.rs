use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::error::QueueError;

/// Dispatch class of a piece of work. `High > Normal > Bulk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    High,
    #[default]
    Normal,
    Bulk,
}

impl PriorityLevel {
    /// Every level, highest first. This is the polling order.
    pub const ALL: [PriorityLevel; 3] = [PriorityLevel::High, PriorityLevel::Normal, PriorityLevel::Bulk];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityLevel::High => "high",
            PriorityLevel::Normal => "normal",
            PriorityLevel::Bulk => "bulk",
        }
    }

    fn rank(self) -> u8 {
        match self {
            PriorityLevel::High => 2,
            PriorityLevel::Normal => 1,
            PriorityLevel::Bulk => 0,
        }
    }
}

impl Ord for PriorityLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for PriorityLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityLevel {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "high" => Ok(PriorityLevel::High),
            "normal" => Ok(PriorityLevel::Normal),
            "bulk" => Ok(PriorityLevel::Bulk),
            other => Err(QueueError::InvalidArgument(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}
