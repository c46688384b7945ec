use std::sync::Arc;
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{FixedInterval, jitter};
use tracing::{debug, error, info, warn};

use crate::config::ScraperConfig;
use crate::error::FetchError;
use crate::models::{Batch, BatchCompletionRecord, ListingRecord, SessionStats};
use crate::policy::PacingPlanner;
use crate::scraper::{Activity, FetchedPage, PageFetcher};
use crate::storage::{DatasetStore, MergeReport, ProgressStore};
use crate::utils::{Clock, Shutdown};

/// How often a page that failed transiently is tried again.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl From<&ScraperConfig> for RetryPolicy {
    fn from(cfg: &ScraperConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub batch_id: u32,
    pub pages_succeeded: u32,
    pub pages_failed: u32,
    pub listings: usize,
    pub merge: Option<MergeReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Completed(BatchResult),
    /// Stopped by shutdown; progress was not advanced.
    Interrupted(BatchResult),
}

/// Drives a single batch: pages in ascending order, one failed page never
/// aborts the batch, results merged and progress advanced at the end.
pub struct BatchRunner {
    progress: Arc<ProgressStore>,
    dataset: DatasetStore,
    planner: PacingPlanner,
    activity: Box<dyn Activity>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl BatchRunner {
    pub fn new(
        progress: Arc<ProgressStore>,
        dataset: DatasetStore,
        planner: PacingPlanner,
        activity: Box<dyn Activity>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            progress,
            dataset,
            planner,
            activity,
            retry,
            clock,
        }
    }

    pub fn set_activity(&mut self, activity: Box<dyn Activity>) {
        self.activity = activity;
    }

    pub async fn run<F: PageFetcher + ?Sized>(
        &self,
        batch: &Batch,
        fetcher: &F,
        stats: &mut SessionStats,
        shutdown: &mut Shutdown,
    ) -> BatchOutcome {
        info!(
            "{} starting: pages {}-{}",
            batch.label, batch.start_page, batch.end_page
        );

        let mut buffer: Vec<ListingRecord> = Vec::new();
        let mut result = BatchResult {
            batch_id: batch.id,
            ..Default::default()
        };
        let mut interrupted = false;

        for page in batch.pages() {
            match shutdown.guard(self.fetch_with_retry(fetcher, batch.id, page)).await {
                None => {
                    interrupted = true;
                    break;
                }
                Some(Ok(fetched)) => {
                    let n = fetched.records.len();
                    if n == 0 {
                        warn!("Batch {} page {}: no listings found", batch.id, page);
                    } else {
                        info!("Batch {} page {}: {} listings", batch.id, page, n);
                    }
                    stats.record_success(n, fetched.latency_secs);
                    result.pages_succeeded += 1;
                    result.listings += n;
                    buffer.extend(fetched.records);
                }
                Some(Err(e)) => {
                    error!("Batch {} page {} failed: {}", batch.id, page, e);
                    stats.record_failure();
                    result.pages_failed += 1;
                }
            }

            if page < batch.end_page && !self.pace(shutdown).await {
                interrupted = true;
                break;
            }
        }

        let now = self.clock.now();
        // Partial results are merged too; keep-last makes the re-run harmless.
        result.merge = if buffer.is_empty() {
            None
        } else {
            self.dataset.merge_or_stash(&buffer, now)
        };

        let mut state = self.progress.load();
        state.last_session = Some(stats.snapshot(now));

        if interrupted {
            warn!(
                "{} interrupted after {} pages; it will run again from page {}",
                batch.label,
                result.pages_succeeded + result.pages_failed,
                batch.start_page
            );
            self.progress.save(&state);
            return BatchOutcome::Interrupted(result);
        }

        state.roll_over(now.date());
        state.completed_batches.push(BatchCompletionRecord {
            id: batch.id,
            label: batch.label.clone(),
            start_page: batch.start_page,
            end_page: batch.end_page,
            completed_at: now,
            completed_date: now.date(),
            pages_scraped: batch.page_count(),
            listings_found: buffer.len(),
        });
        state.current_batch_id = batch.id + 1;
        state.daily_pages_scraped += batch.page_count();
        self.progress.save(&state);

        info!(
            "{} completed: {} listings, {}/{} pages ok, {} pages today",
            batch.label,
            result.listings,
            result.pages_succeeded,
            batch.page_count(),
            state.daily_pages_scraped
        );
        BatchOutcome::Completed(result)
    }

    async fn fetch_with_retry<F: PageFetcher + ?Sized>(
        &self,
        fetcher: &F,
        batch_id: u32,
        page: u32,
    ) -> Result<FetchedPage, FetchError> {
        let strategy = FixedInterval::new(self.retry.delay)
            .map(jitter)
            .take(self.retry.max_retries as usize);

        let mut attempt = 0u32;
        RetryIf::spawn(
            strategy,
            move || {
                attempt += 1;
                if attempt > 1 {
                    debug!("Batch {} page {}: attempt {}", batch_id, page, attempt);
                }
                fetcher.fetch(page)
            },
            |e: &FetchError| {
                let retry = e.is_transient();
                if retry {
                    warn!("Batch {} page {}: transient failure, retrying: {}", batch_id, page, e);
                }
                retry
            },
        )
        .await
    }

    /// Inter-page delay with activity between sub-sleeps. `false` if
    /// interrupted.
    async fn pace(&self, shutdown: &mut Shutdown) -> bool {
        let plan = self.planner.inter_page_delay();
        debug!(
            "Page delay: {:.1}s in {} parts",
            plan.total.as_secs_f64(),
            plan.chunks.len()
        );
        for (i, chunk) in plan.chunks.iter().enumerate() {
            if i % 2 == 1 && shutdown.guard(self.activity.perform()).await.is_none() {
                return false;
            }
            if !shutdown.sleep(*chunk).await {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::PacingConfig;
    use crate::error::SetupError;
    use crate::models::ProgressState;
    use crate::scraper::Idle;
    use crate::utils::clock::FixedClock;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fetcher with scripted failures that records every call.
    #[derive(Default)]
    pub(crate) struct ScriptedFetcher {
        pub fail_pages: HashSet<u32>,
        pub transient_once: Mutex<HashSet<u32>>,
        pub empty_pages: HashSet<u32>,
        pub fail_acquire: bool,
        pub calls: Mutex<Vec<u32>>,
        pub acquired: AtomicU32,
        pub released: AtomicU32,
    }

    impl ScriptedFetcher {
        pub fn failing_on(pages: &[u32]) -> Self {
            Self {
                fail_pages: pages.iter().copied().collect(),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn acquire(&mut self) -> Result<(), SetupError> {
            if self.fail_acquire {
                return Err(SetupError::Config("no browser".into()));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        async fn fetch(&self, page: u32) -> Result<FetchedPage, FetchError> {
            self.calls.lock().unwrap().push(page);
            if self.transient_once.lock().unwrap().remove(&page) {
                return Err(FetchError::Status { page, status: 503 });
            }
            if self.fail_pages.contains(&page) {
                return Err(FetchError::Status { page, status: 404 });
            }
            if self.empty_pages.contains(&page) {
                return Ok(FetchedPage {
                    records: vec![],
                    latency_secs: 1.0,
                });
            }
            let records = (1..=2)
                .map(|i| {
                    ListingRecord::new(format!("https://example.com/{}/{}", page, i))
                        .with("price", (page * 1000 + i).to_string())
                })
                .collect();
            Ok(FetchedPage {
                records,
                latency_secs: 2.0,
            })
        }
    }

    pub(crate) fn instant_pacing() -> PacingConfig {
        PacingConfig {
            min_page_delay_secs: 0.0,
            max_page_delay_secs: 0.0,
            min_page_activity_secs: 0.0,
            max_page_activity_secs: 0.0,
            ..PacingConfig::default()
        }
    }

    pub(crate) fn ten_am() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    struct Fixture {
        progress: Arc<ProgressStore>,
        runner: BatchRunner,
        stats: SessionStats,
    }

    fn fixture(dir: &Path) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(ten_am()));
        let progress = Arc::new(ProgressStore::new(dir.join("progress.json"), clock.clone()));
        let runner = BatchRunner::new(
            progress.clone(),
            DatasetStore::new(dir.join("dataset.csv")),
            PacingPlanner::new(instant_pacing()),
            Box::new(Idle),
            RetryPolicy {
                max_retries: 2,
                delay: Duration::ZERO,
            },
            clock,
        );
        Fixture {
            progress,
            runner,
            stats: SessionStats::new(ten_am()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_page_failure_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());
        let fetcher = ScriptedFetcher::failing_on(&[55]);
        let (_trigger, mut shutdown) = Shutdown::new();

        let outcome = fx
            .runner
            .run(&Batch::new(1, 51, 60), &fetcher, &mut fx.stats, &mut shutdown)
            .await;

        let BatchOutcome::Completed(result) = outcome else {
            panic!("batch should complete");
        };
        assert_eq!(fx.stats.failed_pages, 1);
        assert_eq!(fx.stats.successful_pages, 9);
        assert_eq!(result.pages_failed, 1);
        assert_eq!(fetcher.calls(), (51..=60).collect::<Vec<_>>());

        let state = fx.progress.load();
        assert_eq!(state.current_batch_id, 2);
        assert_eq!(state.daily_pages_scraped, 10);
        assert_eq!(state.completed_batches[0].listings_found, 18);
        assert_eq!(result.merge.unwrap().total, 18);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_id_advances_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());
        let fetcher = ScriptedFetcher::default();
        let (_trigger, mut shutdown) = Shutdown::new();

        for (id, start) in [(1, 1), (2, 4), (3, 7)] {
            fx.runner
                .run(&Batch::new(id, start, start + 2), &fetcher, &mut fx.stats, &mut shutdown)
                .await;
        }

        let state = fx.progress.load();
        assert_eq!(state.current_batch_id, 4);
        let ids: Vec<_> = state.completed_batches.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(state.daily_pages_scraped, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_counter_resets_on_new_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());
        let mut stale = ProgressState::new(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        stale.daily_pages_scraped = 40;
        fx.progress.save(&stale);

        let fetcher = ScriptedFetcher::default();
        let (_trigger, mut shutdown) = Shutdown::new();
        fx.runner
            .run(&Batch::new(1, 51, 60), &fetcher, &mut fx.stats, &mut shutdown)
            .await;

        let state = fx.progress.load();
        assert_eq!(state.daily_pages_scraped, 10);
        assert_eq!(state.last_scrape_date, ten_am().date());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());
        let fetcher = ScriptedFetcher::default();
        fetcher.transient_once.lock().unwrap().insert(3);
        let (_trigger, mut shutdown) = Shutdown::new();

        fx.runner
            .run(&Batch::new(1, 1, 5), &fetcher, &mut fx.stats, &mut shutdown)
            .await;

        assert_eq!(fx.stats.successful_pages, 5);
        assert_eq!(fx.stats.failed_pages, 0);
        assert_eq!(fetcher.calls(), vec![1, 2, 3, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());
        let fetcher = ScriptedFetcher::failing_on(&[2]);
        let (_trigger, mut shutdown) = Shutdown::new();

        fx.runner
            .run(&Batch::new(1, 1, 3), &fetcher, &mut fx.stats, &mut shutdown)
            .await;

        assert_eq!(fetcher.calls(), vec![1, 2, 3]);
        assert_eq!(fx.stats.failed_pages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_page_counts_as_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());
        let fetcher = ScriptedFetcher {
            empty_pages: HashSet::from([2]),
            ..Default::default()
        };
        let (_trigger, mut shutdown) = Shutdown::new();

        fx.runner
            .run(&Batch::new(1, 1, 3), &fetcher, &mut fx.stats, &mut shutdown)
            .await;

        assert_eq!(fx.stats.successful_pages, 3);
        assert_eq!(fx.stats.total_listings, 4);
        assert!((fx.stats.avg_response_time_secs - 5.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_keeps_batch_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());
        let fetcher = ScriptedFetcher::default();
        let (trigger, mut shutdown) = Shutdown::new();
        trigger.trigger();

        let outcome = fx
            .runner
            .run(&Batch::new(1, 51, 60), &fetcher, &mut fx.stats, &mut shutdown)
            .await;

        assert!(matches!(outcome, BatchOutcome::Interrupted(_)));
        assert!(fetcher.calls().is_empty());
        let state = fx.progress.load();
        assert_eq!(state.current_batch_id, 1);
        assert!(state.completed_batches.is_empty());
        assert!(state.last_session.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_of_same_pages_does_not_duplicate_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());
        let fetcher = ScriptedFetcher::default();
        let (_trigger, mut shutdown) = Shutdown::new();

        fx.runner
            .run(&Batch::new(1, 1, 3), &fetcher, &mut fx.stats, &mut shutdown)
            .await;
        let BatchOutcome::Completed(second) = fx
            .runner
            .run(&Batch::new(2, 1, 3), &fetcher, &mut fx.stats, &mut shutdown)
            .await
        else {
            panic!("batch should complete");
        };

        let merge = second.merge.unwrap();
        assert_eq!(merge.added, 0);
        assert_eq!(merge.replaced, 6);
        assert_eq!(merge.total, 6);
    }
}
