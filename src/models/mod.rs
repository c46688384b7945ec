use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Batch ─────────────────────────────────────────────────────────────────────

/// A contiguous, pre-configured page range scraped as one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batch {
    pub id: u32,
    #[serde(alias = "start")]
    pub start_page: u32,
    #[serde(alias = "end")]
    pub end_page: u32,
    #[serde(default, alias = "name")]
    pub label: String,
}

impl Batch {
    pub fn new(id: u32, start_page: u32, end_page: u32) -> Self {
        Self {
            id,
            start_page,
            end_page,
            label: Self::default_label(id, start_page, end_page),
        }
    }

    pub fn default_label(id: u32, start_page: u32, end_page: u32) -> String {
        format!("Batch {} ({}-{})", id, start_page, end_page)
    }

    pub fn pages(&self) -> std::ops::RangeInclusive<u32> {
        self.start_page..=self.end_page
    }

    pub fn page_count(&self) -> u32 {
        self.end_page.saturating_sub(self.start_page) + 1
    }
}

// ── Listing ───────────────────────────────────────────────────────────────────

/// One harvested listing. Only `url` has meaning to the engine; every other
/// column is carried through to the dataset untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListingRecord {
    pub url: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

impl ListingRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        if key == "url" {
            return Some(&self.url);
        }
        self.fields.get(key).map(String::as_str)
    }
}

// ── Progress ──────────────────────────────────────────────────────────────────

/// Append-only log entry written when a batch finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchCompletionRecord {
    pub id: u32,
    #[serde(default, alias = "name")]
    pub label: String,
    #[serde(default, alias = "start")]
    pub start_page: u32,
    #[serde(default, alias = "end")]
    pub end_page: u32,
    #[serde(default, with = "timestamp")]
    pub completed_at: NaiveDateTime,
    #[serde(default, alias = "date")]
    pub completed_date: NaiveDate,
    #[serde(default)]
    pub pages_scraped: u32,
    #[serde(default)]
    pub listings_found: usize,
}

/// Counters of the last session, persisted for operators reading the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub successful_pages: u32,
    #[serde(default)]
    pub failed_pages: u32,
    #[serde(default)]
    pub total_listings: usize,
    #[serde(default, alias = "avg_response_time")]
    pub avg_response_time_secs: f64,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<NaiveDateTime>,
}

/// Durable scheduling state. Unknown keys are ignored and missing keys take
/// the defaults below, so older and newer files both load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressState {
    #[serde(default = "first_batch_id")]
    pub current_batch_id: u32,
    #[serde(default)]
    pub completed_batches: Vec<BatchCompletionRecord>,
    #[serde(default)]
    pub daily_pages_scraped: u32,
    #[serde(default = "today")]
    pub last_scrape_date: NaiveDate,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub next_session_time: Option<NaiveDateTime>,
    #[serde(default, alias = "session_stats", skip_serializing_if = "Option::is_none")]
    pub last_session: Option<SessionSnapshot>,
}

fn first_batch_id() -> u32 {
    1
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

impl ProgressState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            current_batch_id: first_batch_id(),
            completed_batches: Vec::new(),
            daily_pages_scraped: 0,
            last_scrape_date: today,
            next_session_time: None,
            last_session: None,
        }
    }

    /// The configured batch whose id is `current_batch_id`.
    pub fn next_batch<'a>(&self, batches: &'a [Batch]) -> Option<&'a Batch> {
        batches.iter().find(|b| b.id == self.current_batch_id)
    }

    /// Reset the daily page counter if `today` is a later calendar day.
    pub fn roll_over(&mut self, today: NaiveDate) {
        if self.last_scrape_date != today {
            self.daily_pages_scraped = 0;
            self.last_scrape_date = today;
        }
    }

    /// Pages scraped on `today`; a stale counter from an earlier day is zero.
    pub fn pages_scraped_on(&self, today: NaiveDate) -> u32 {
        if self.last_scrape_date == today {
            self.daily_pages_scraped
        } else {
            0
        }
    }

    pub fn batches_completed_on(&self, day: NaiveDate) -> usize {
        self.completed_batches
            .iter()
            .filter(|b| b.completed_date == day)
            .count()
    }
}

// ── Session statistics ────────────────────────────────────────────────────────

/// In-memory telemetry for one process lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub successful_pages: u32,
    pub failed_pages: u32,
    pub total_listings: usize,
    pub avg_response_time_secs: f64,
    pub session_start_time: NaiveDateTime,
}

impl SessionStats {
    pub fn new(started: NaiveDateTime) -> Self {
        Self {
            successful_pages: 0,
            failed_pages: 0,
            total_listings: 0,
            avg_response_time_secs: 0.0,
            session_start_time: started,
        }
    }

    /// Count a successful page and fold its latency into the running mean.
    pub fn record_success(&mut self, listings: usize, latency_secs: f64) {
        self.successful_pages += 1;
        self.total_listings += listings;
        let n = f64::from(self.successful_pages);
        self.avg_response_time_secs = (self.avg_response_time_secs * (n - 1.0) + latency_secs) / n;
    }

    pub fn record_failure(&mut self) {
        self.failed_pages += 1;
    }

    pub fn pages_attempted(&self) -> u32 {
        self.successful_pages + self.failed_pages
    }

    pub fn snapshot(&self, at: NaiveDateTime) -> SessionSnapshot {
        SessionSnapshot {
            successful_pages: self.successful_pages,
            failed_pages: self.failed_pages,
            total_listings: self.total_listings,
            avg_response_time_secs: self.avg_response_time_secs,
            recorded_at: Some(at),
        }
    }
}

// ── Timestamp encoding ────────────────────────────────────────────────────────

/// `YYYY-MM-DD HH:MM:SS` on write; ISO-8601 with a `T` is accepted on read.
pub mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn parse(s: &str) -> Option<NaiveDateTime> {
        let s = s.trim();
        NaiveDateTime::parse_from_str(s, FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
    }

    pub fn format(ts: &NaiveDateTime) -> String {
        ts.format(FORMAT).to_string()
    }

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("bad timestamp {:?}", raw)))
    }

    pub mod option {
        use chrono::NaiveDateTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(ts: &Option<NaiveDateTime>, s: S) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_str(&super::format(ts)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<NaiveDateTime>, D::Error> {
            let raw: Option<String> = Option::deserialize(d)?;
            match raw {
                None => Ok(None),
                Some(s) => super::parse(&s)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("bad timestamp {:?}", s))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_running_mean_over_successes_only() {
        let start = day(2024, 3, 1).and_hms_opt(9, 0, 0).unwrap();
        let mut stats = SessionStats::new(start);
        stats.record_success(20, 2.0);
        stats.record_failure();
        stats.record_success(18, 4.0);
        stats.record_success(0, 6.0);

        assert_eq!(stats.successful_pages, 3);
        assert_eq!(stats.failed_pages, 1);
        assert_eq!(stats.total_listings, 38);
        assert!((stats.avg_response_time_secs - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_roll_over_resets_only_on_new_day() {
        let mut state = ProgressState::new(day(2024, 3, 1));
        state.daily_pages_scraped = 30;

        state.roll_over(day(2024, 3, 1));
        assert_eq!(state.daily_pages_scraped, 30);

        state.roll_over(day(2024, 3, 2));
        assert_eq!(state.daily_pages_scraped, 0);
        assert_eq!(state.last_scrape_date, day(2024, 3, 2));
    }

    #[test]
    fn test_stale_daily_counter_reads_as_zero() {
        let mut state = ProgressState::new(day(2024, 3, 1));
        state.daily_pages_scraped = 50;
        assert_eq!(state.pages_scraped_on(day(2024, 3, 1)), 50);
        assert_eq!(state.pages_scraped_on(day(2024, 3, 2)), 0);
    }

    #[test]
    fn test_batch_page_count() {
        let batch = Batch::new(1, 51, 60);
        assert_eq!(batch.page_count(), 10);
        assert_eq!(batch.pages().count(), 10);
        assert_eq!(Batch::new(2, 7, 7).page_count(), 1);
    }

    #[test]
    fn test_timestamp_accepts_both_layouts() {
        let a = timestamp::parse("2024-03-01 14:05:09").unwrap();
        let b = timestamp::parse("2024-03-01T14:05:09").unwrap();
        assert_eq!(a, b);
        assert_eq!(timestamp::format(&a), "2024-03-01 14:05:09");
        assert!(timestamp::parse("yesterday").is_none());
    }
}
