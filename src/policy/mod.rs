//! Scheduling policy: risk signal, pacing, continuation decision.

pub mod decider;
pub mod pacing;
pub mod risk;

pub use self::decider::{ContinuationDecider, Decision, WaitReason};
pub use self::pacing::PacingPlanner;
pub use self::risk::{RiskAssessor, RiskLevel, success_rate};
