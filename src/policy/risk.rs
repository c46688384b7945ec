use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::SessionStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        })
    }
}

/// Share of attempted pages that succeeded, in percent. 100 before any page.
pub fn success_rate(successful: u32, failed: u32) -> f64 {
    let total = successful + failed;
    if total == 0 {
        return 100.0;
    }
    f64::from(successful) / f64::from(total) * 100.0
}

/// Seam for the decider's health guard, so tests can observe evaluation.
pub trait Assess {
    fn success_rate(&self, stats: &SessionStats) -> f64;
    fn assess(&self, success_rate: f64, avg_response_secs: f64) -> RiskLevel;

    fn risk_of(&self, stats: &SessionStats) -> RiskLevel {
        self.assess(self.success_rate(stats), stats.avg_response_time_secs)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RiskAssessor;

impl Assess for RiskAssessor {
    fn success_rate(&self, stats: &SessionStats) -> f64 {
        success_rate(stats.successful_pages, stats.failed_pages)
    }

    fn assess(&self, success_rate: f64, avg_response_secs: f64) -> RiskLevel {
        if success_rate >= 95.0 && avg_response_secs < 3.0 {
            RiskLevel::Low
        } else if success_rate >= 85.0 && avg_response_secs < 5.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}
