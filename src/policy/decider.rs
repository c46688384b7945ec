//! Continuation decision after each batch.
//!
//! Guards run in a fixed order and the first one that trips decides:
//!
//! 1. daily page limit reached            → wait for tomorrow
//! 2. same-day batch limit reached        → wait for tomorrow
//! 3. session success rate below minimum  → wait for tomorrow
//! 4. local hour at or past the cutoff    → wait for tomorrow
//! 5. no configured batch left            → done
//! 6. otherwise                           → continue after a risk-scaled break
//!
//! Waiting writes `next_session_time = now + 1 day` to the progress file.
//! Nothing else is mutated.

use chrono::{Duration as ChronoDuration, NaiveDateTime, Timelike};
use std::fmt;
use std::time::Duration;
use tracing::info;

use super::pacing::PacingPlanner;
use super::risk::{Assess, RiskAssessor, RiskLevel};
use crate::config::ContinuationRules;
use crate::models::{Batch, ProgressState, SessionStats};
use crate::storage::ProgressStore;

#[derive(Debug, Clone, PartialEq)]
pub enum WaitReason {
    DailyPageLimit { scraped: u32, limit: u32 },
    SameDayBatchLimit { completed: usize, limit: usize },
    LowSuccessRate { rate: f64, threshold: f64 },
    AfterCutoff { hour: u32, cutoff: u32 },
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitReason::DailyPageLimit { scraped, limit } => {
                write!(f, "daily page limit reached ({}/{})", scraped, limit)
            }
            WaitReason::SameDayBatchLimit { completed, limit } => {
                write!(f, "same-day batch limit reached ({}/{})", completed, limit)
            }
            WaitReason::LowSuccessRate { rate, threshold } => {
                write!(f, "success rate {:.1}% below {:.1}%", rate, threshold)
            }
            WaitReason::AfterCutoff { hour, cutoff } => {
                write!(f, "hour {} is at or past the {}:00 cutoff", hour, cutoff)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Continue { risk: RiskLevel, pause: Duration },
    WaitForTomorrow { reason: WaitReason, resume_at: NaiveDateTime },
    Done,
}

pub struct ContinuationDecider<A = RiskAssessor> {
    rules: ContinuationRules,
    planner: PacingPlanner,
    batches: Vec<Batch>,
    assessor: A,
}

impl ContinuationDecider<RiskAssessor> {
    pub fn new(rules: ContinuationRules, planner: PacingPlanner, batches: Vec<Batch>) -> Self {
        Self::with_assessor(rules, planner, batches, RiskAssessor)
    }
}

impl<A: Assess> ContinuationDecider<A> {
    pub fn with_assessor(
        rules: ContinuationRules,
        planner: PacingPlanner,
        batches: Vec<Batch>,
        assessor: A,
    ) -> Self {
        Self {
            rules,
            planner,
            batches,
            assessor,
        }
    }

    /// Guards 1–4. `Some` names the first guard that tripped.
    pub fn evaluate(
        &self,
        state: &ProgressState,
        stats: &SessionStats,
        now: NaiveDateTime,
    ) -> Option<WaitReason> {
        let today = now.date();

        let scraped = state.pages_scraped_on(today);
        if scraped >= self.rules.daily_page_limit {
            return Some(WaitReason::DailyPageLimit {
                scraped,
                limit: self.rules.daily_page_limit,
            });
        }

        let completed = state.batches_completed_on(today);
        if completed >= self.rules.same_day_max_batches {
            return Some(WaitReason::SameDayBatchLimit {
                completed,
                limit: self.rules.same_day_max_batches,
            });
        }

        let rate = self.assessor.success_rate(stats);
        if rate < self.rules.success_threshold {
            return Some(WaitReason::LowSuccessRate {
                rate,
                threshold: self.rules.success_threshold,
            });
        }

        let hour = now.hour();
        if hour >= self.rules.cutoff_hour {
            return Some(WaitReason::AfterCutoff {
                hour,
                cutoff: self.rules.cutoff_hour,
            });
        }

        None
    }

    pub fn decide(
        &self,
        store: &ProgressStore,
        mut state: ProgressState,
        stats: &SessionStats,
        now: NaiveDateTime,
    ) -> Decision {
        if let Some(reason) = self.evaluate(&state, stats, now) {
            let resume_at = now + ChronoDuration::days(1);
            info!("Stopping for today: {}. Next session at {}", reason, resume_at);
            state.next_session_time = Some(resume_at);
            store.save(&state);
            return Decision::WaitForTomorrow { reason, resume_at };
        }

        if state.next_batch(&self.batches).is_none() {
            info!("All configured batches are complete");
            return Decision::Done;
        }

        let risk = self.assessor.risk_of(stats);
        let pause = self.planner.break_duration(risk);
        info!(
            "All checks OK (risk {}), next batch after a {:.0} minute break",
            risk,
            pause.as_secs_f64() / 60.0
        );
        Decision::Continue { risk, pause }
    }
}
