use std::time::Duration;

use super::risk::RiskLevel;
use crate::config::PacingConfig;

/// Inter-page delay split into sub-intervals; the caller sleeps each one and
/// may perform low-cost activity in between.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayPlan {
    pub total: Duration,
    pub chunks: Vec<Duration>,
}

#[derive(Debug, Clone)]
pub struct PacingPlanner {
    cfg: PacingConfig,
}

impl PacingPlanner {
    pub fn new(cfg: PacingConfig) -> Self {
        Self { cfg }
    }

    /// Minutes of rest between batches, longer as risk rises.
    pub fn optimal_break_minutes(&self, risk: RiskLevel) -> f64 {
        let min = self.cfg.min_break_minutes;
        let (lo, hi) = match risk {
            RiskLevel::Low => (min, min + 30.0),
            RiskLevel::Medium => (min + 30.0, min + 60.0),
            RiskLevel::High => (min + 60.0, self.cfg.max_break_minutes),
        };
        uniform(lo, hi)
    }

    pub fn break_duration(&self, risk: RiskLevel) -> Duration {
        Duration::from_secs_f64(self.optimal_break_minutes(risk) * 60.0)
    }

    pub fn inter_page_delay(&self) -> DelayPlan {
        let total = uniform(self.cfg.min_page_delay_secs, self.cfg.max_page_delay_secs);
        let n: u32 = rand::random_range(3..=6);
        let chunk = Duration::from_secs_f64(total / f64::from(n));
        DelayPlan {
            total: Duration::from_secs_f64(total),
            chunks: vec![chunk; n as usize],
        }
    }

    /// Dwell time on a freshly loaded page.
    pub fn page_activity(&self) -> Duration {
        Duration::from_secs_f64(uniform(
            self.cfg.min_page_activity_secs,
            self.cfg.max_page_activity_secs,
        ))
    }

    /// Pauses at least this long release the fetcher session.
    pub fn session_release_threshold(&self) -> Duration {
        Duration::from_secs(self.cfg.session_release_threshold_secs)
    }
}

/// Uniform draw over `[a, b]` in either order.
fn uniform(a: f64, b: f64) -> f64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if hi - lo <= f64::EPSILON {
        return lo.max(0.0);
    }
    rand::random_range(lo..=hi).max(0.0)
}
