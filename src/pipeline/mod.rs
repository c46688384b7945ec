//! Orchestrator: ties fetcher → batch runner → stores → decider together.
//!
//! ## Loop
//!
//! 1. Ask the progress file for the next configured batch; none left → done.
//! 2. Run it (pages in order, failures contained, merge + progress at the end).
//! 3. Ask the decider: wait for tomorrow → stop; done → stop; continue →
//!    take the risk-scaled break and go to 1.
//!
//! The loop is iterative so a multi-day session never grows the stack. The
//! fetcher session is released before any pause at or above the configured
//! threshold and acquired again afterwards.
//!
//! A stored `next_session_time` defers the run only while its calendar day is
//! still ahead, so a daily start at a fixed hour is never turned away.

pub mod runner;

use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::AppConfig;
use crate::error::SetupError;
use crate::models::{Batch, SessionStats};
use crate::policy::{ContinuationDecider, Decision, PacingPlanner, WaitReason};
use crate::scraper::{Activity, Idle, PageFetcher};
use crate::storage::{DatasetStore, ProgressStore};
use crate::utils::{Clock, Shutdown, fmt_duration};

use self::runner::{BatchOutcome, BatchRunner, RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every configured batch is complete.
    Done,
    /// A guard stopped the session; `resume_at` is persisted.
    ResumeTomorrow {
        reason: WaitReason,
        resume_at: NaiveDateTime,
    },
    /// An earlier run scheduled the next session for a later day.
    Deferred { until: NaiveDateTime },
    Interrupted,
}

pub struct Orchestrator<F: PageFetcher> {
    batches: Vec<Batch>,
    progress: Arc<ProgressStore>,
    runner: BatchRunner,
    decider: ContinuationDecider,
    planner: PacingPlanner,
    fetcher: F,
    stats: SessionStats,
    clock: Arc<dyn Clock>,
    shutdown: Shutdown,
    force: bool,
    session_open: bool,
}

impl<F: PageFetcher> Orchestrator<F> {
    pub fn new(config: &AppConfig, fetcher: F, clock: Arc<dyn Clock>, shutdown: Shutdown) -> Self {
        let planner = PacingPlanner::new(config.pacing.clone());
        let progress = Arc::new(ProgressStore::new(
            config.storage.progress_path.clone(),
            clock.clone(),
        ));
        let runner = BatchRunner::new(
            progress.clone(),
            DatasetStore::new(config.storage.dataset_path.clone()),
            planner.clone(),
            Box::new(Idle),
            RetryPolicy::from(&config.scraper),
            clock.clone(),
        );
        let decider =
            ContinuationDecider::new(config.rules.clone(), planner.clone(), config.batches.clone());

        Self {
            batches: config.batches.clone(),
            progress,
            runner,
            decider,
            planner,
            fetcher,
            stats: SessionStats::new(clock.now()),
            clock,
            shutdown,
            force: false,
            session_open: false,
        }
    }

    pub fn with_activity(mut self, activity: Box<dyn Activity>) -> Self {
        self.runner.set_activity(activity);
        self
    }

    /// Ignore a scheduled next-session time.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub async fn run(&mut self) -> Result<RunOutcome, SetupError> {
        let mut state = self.progress.load();
        if let Some(at) = state.next_session_time {
            if at.date() > self.clock.today() && !self.force {
                info!("Next session is scheduled for {}; nothing to do yet", at);
                return Ok(RunOutcome::Deferred { until: at });
            }
            state.next_session_time = None;
            self.progress.save(&state);
        }

        if state.next_batch(&self.batches).is_none() {
            info!("All batches completed!");
            return Ok(RunOutcome::Done);
        }

        self.open_session().await?;
        let outcome = self.drive().await;
        self.close_session().await;
        outcome
    }

    async fn open_session(&mut self) -> Result<(), SetupError> {
        if !self.session_open {
            self.fetcher.acquire().await?;
            self.session_open = true;
        }
        Ok(())
    }

    async fn close_session(&mut self) {
        if self.session_open {
            self.fetcher.release().await;
            self.session_open = false;
        }
    }

    async fn drive(&mut self) -> Result<RunOutcome, SetupError> {
        loop {
            let Some(batch) = self.progress.next_batch(&self.batches) else {
                info!("All batches completed!");
                return Ok(RunOutcome::Done);
            };

            let outcome = self
                .runner
                .run(&batch, &self.fetcher, &mut self.stats, &mut self.shutdown)
                .await;
            if let BatchOutcome::Interrupted(_) = outcome {
                return Ok(RunOutcome::Interrupted);
            }

            info!("Batch {} completed, making continuation decision", batch.id);
            let now = self.clock.now();
            match self
                .decider
                .decide(&self.progress, self.progress.load(), &self.stats, now)
            {
                Decision::WaitForTomorrow { reason, resume_at } => {
                    return Ok(RunOutcome::ResumeTomorrow { reason, resume_at });
                }
                Decision::Done => return Ok(RunOutcome::Done),
                Decision::Continue { pause, .. } => {
                    if !self.take_break(pause).await? {
                        return Ok(RunOutcome::Interrupted);
                    }
                }
            }
        }
    }

    /// `false` if interrupted during the break.
    async fn take_break(&mut self, pause: Duration) -> Result<bool, SetupError> {
        let release = pause >= self.planner.session_release_threshold();
        if release {
            self.close_session().await;
        }

        info!("{} break starting", fmt_duration(pause));
        if !self.shutdown.sleep(pause).await {
            return Ok(false);
        }
        info!("Break completed, starting new session");

        if release {
            self.open_session().await?;
        }
        Ok(true)
    }
}
