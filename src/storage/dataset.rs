use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::atomic_write;
use crate::error::StoreError;
use crate::models::ListingRecord;

const KEY_COLUMN: &str = "url";

// ── Dataset ───────────────────────────────────────────────────────────────────

/// In-memory image of the dataset file. Keyed by `url`, keep-last: a record
/// whose url is already present replaces the stored one in place.
#[derive(Debug, Default, Clone)]
pub struct Dataset {
    columns: Vec<String>,
    records: Vec<ListingRecord>,
    index: HashMap<String, usize>,
    /// Rows with an empty url, carried through unchanged.
    unkeyed: Vec<ListingRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Replaced,
    Skipped,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.records.len() + self.unkeyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> impl Iterator<Item = &ListingRecord> {
        self.records.iter().chain(self.unkeyed.iter())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn get(&self, url: &str) -> Option<&ListingRecord> {
        self.index.get(url).map(|&i| &self.records[i])
    }

    pub fn upsert(&mut self, record: ListingRecord) -> Upsert {
        if record.url.trim().is_empty() {
            return Upsert::Skipped;
        }
        self.track_columns(&record);
        match self.index.get(&record.url) {
            Some(&i) => {
                self.records[i] = record;
                Upsert::Replaced
            }
            None => {
                self.index.insert(record.url.clone(), self.records.len());
                self.records.push(record);
                Upsert::Added
            }
        }
    }

    /// Most common non-empty value of `column`, with its count.
    pub fn most_common(&self, column: &str) -> Option<(String, usize)> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for value in self.records().filter_map(|r| r.get(column)) {
            let value = value.trim();
            if !value.is_empty() && value != "N/A" {
                *counts.entry(value).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(v, n)| (v.to_string(), n))
    }

    fn track_columns(&mut self, record: &ListingRecord) {
        if self.columns.is_empty() {
            self.columns.push(KEY_COLUMN.to_string());
        }
        for key in record.fields.keys() {
            if !self.columns.iter().any(|c| c == key) {
                self.columns.push(key.clone());
            }
        }
    }

    fn to_csv(&self) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        if !self.columns.is_empty() {
            writer.write_record(&self.columns)?;
        }
        for record in self.records() {
            writer.write_record(self.columns.iter().map(|c| record.get(c).unwrap_or("")))?;
        }
        writer.into_inner().map_err(|e| csv::Error::from(e.into_error()))
    }
}

// ── Merge report ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Rows in the file before the merge, after collapsing duplicates.
    pub existing: usize,
    /// Duplicate rows found (and collapsed) in the existing file.
    pub collapsed: usize,
    pub incoming: usize,
    pub added: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub total: usize,
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// CSV-backed listing dataset, unique by `url`.
pub struct DatasetStore {
    path: PathBuf,
}

impl DatasetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file. A missing file is an empty dataset; duplicates
    /// already in the file are collapsed keep-last.
    pub fn load(&self) -> Result<Dataset, StoreError> {
        self.load_counting().map(|(dataset, _)| dataset)
    }

    fn load_counting(&self) -> Result<(Dataset, usize), StoreError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Dataset::default(), 0)),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let csv_err = |source| StoreError::Csv {
            path: self.path.clone(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);
        let headers: Vec<String> = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(str::to_string)
            .collect();

        let mut dataset = Dataset::default();
        if headers.iter().all(|h| h.is_empty()) {
            return Ok((dataset, 0));
        }
        let key_idx = headers
            .iter()
            .position(|h| h == KEY_COLUMN)
            .ok_or_else(|| StoreError::MissingKeyColumn {
                path: self.path.clone(),
            })?;

        dataset.columns.push(KEY_COLUMN.to_string());
        dataset
            .columns
            .extend(headers.iter().filter(|h| h.as_str() != KEY_COLUMN).cloned());

        let mut collapsed = 0;
        for row in reader.records() {
            let row = row.map_err(csv_err)?;
            let mut record = ListingRecord::new(row.get(key_idx).unwrap_or_default());
            for (i, value) in row.iter().enumerate() {
                if i != key_idx {
                    if let Some(name) = headers.get(i) {
                        record.fields.insert(name.clone(), value.to_string());
                    }
                }
            }

            match dataset.upsert(record.clone()) {
                Upsert::Replaced => collapsed += 1,
                Upsert::Skipped => dataset.unkeyed.push(record),
                Upsert::Added => {}
            }
        }

        if collapsed > 0 {
            warn!("{:?} contained {} duplicate url rows; keeping the last of each", self.path, collapsed);
        }
        Ok((dataset, collapsed))
    }

    pub fn save(&self, dataset: &Dataset) -> Result<(), StoreError> {
        write_csv(&self.path, dataset)
    }

    /// Merge `incoming` into the file, keep-last by url.
    pub fn merge(&self, incoming: &[ListingRecord]) -> Result<MergeReport, StoreError> {
        let (mut dataset, collapsed) = self.load_counting()?;
        let mut report = MergeReport {
            existing: dataset.len(),
            collapsed,
            incoming: incoming.len(),
            ..Default::default()
        };

        for record in incoming {
            match dataset.upsert(record.clone()) {
                Upsert::Added => report.added += 1,
                Upsert::Replaced => report.replaced += 1,
                Upsert::Skipped => report.skipped += 1,
            }
        }
        report.total = dataset.len();

        if report.added == 0 && report.replaced == 0 && collapsed == 0 {
            debug!("Dataset unchanged, skipping write");
            return Ok(report);
        }
        self.save(&dataset)?;
        Ok(report)
    }

    /// `merge`, but a failure never loses the batch: the records are written
    /// to a pending file next to the dataset instead.
    pub fn merge_or_stash(
        &self,
        incoming: &[ListingRecord],
        now: NaiveDateTime,
    ) -> Option<MergeReport> {
        match self.merge(incoming) {
            Ok(report) => {
                info!(
                    "Dataset {:?}: {} new, {} updated, {} total",
                    self.path, report.added, report.replaced, report.total
                );
                if report.skipped > 0 {
                    warn!("{} records without url were not stored", report.skipped);
                }
                Some(report)
            }
            Err(e) => {
                error!("Dataset merge failed: {}", e);
                let pending = self.pending_path(now);
                let mut batch = Dataset::default();
                for record in incoming {
                    batch.upsert(record.clone());
                }
                match write_csv(&pending, &batch) {
                    Ok(()) => warn!("{} batch records saved to {:?} instead", batch.len(), pending),
                    Err(e) => error!("Could not stash batch records either: {}", e),
                }
                None
            }
        }
    }

    fn pending_path(&self, now: NaiveDateTime) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        self.path
            .with_file_name(format!("{}.pending-{}.csv", stem, now.format("%Y%m%d-%H%M%S")))
    }
}

fn write_csv(path: &Path, dataset: &Dataset) -> Result<(), StoreError> {
    let bytes = dataset.to_csv().map_err(|source| StoreError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    atomic_write(path, &bytes).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn listing(url: &str, price: &str) -> ListingRecord {
        ListingRecord::new(url).with("price", price)
    }

    #[test]
    fn test_keep_last_replaces_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("total_scrap.csv"));

        store.merge(&[listing("a", "100")]).unwrap();
        let report = store.merge(&[listing("a", "120")]).unwrap();

        assert_eq!(report.replaced, 1);
        let dataset = store.load().unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.get("a").unwrap().get("price"), Some("120"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("total_scrap.csv"));
        let batch = vec![listing("a", "1"), listing("b", "2"), listing("c", "3")];

        store.merge(&batch).unwrap();
        let once = fs::read_to_string(store.path()).unwrap();
        let report = store.merge(&batch).unwrap();
        let twice = fs::read_to_string(store.path()).unwrap();

        assert_eq!(once, twice);
        assert_eq!(report.added, 0);
        assert_eq!(report.total, 3);
    }

    #[test]
    fn test_existing_rows_survive_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("total_scrap.csv"));

        store.merge(&[listing("a", "1"), listing("b", "2")]).unwrap();
        let report = store.merge(&[listing("c", "3")]).unwrap();

        assert_eq!(report.existing, 2);
        assert_eq!(report.added, 1);
        let urls: Vec<_> = store.load().unwrap().records().map(|r| r.url.clone()).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicates_in_existing_file_are_collapsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("total_scrap.csv");
        fs::write(&path, "title,url,price\nOld,a,100\nOther,b,5\nNew,a,110\n").unwrap();
        let store = DatasetStore::new(&path);

        let report = store.merge(&[listing("c", "7")]).unwrap();
        assert_eq!(report.collapsed, 1);
        assert_eq!(report.total, 3);

        let dataset = store.load().unwrap();
        assert_eq!(dataset.get("a").unwrap().get("title"), Some("New"));
        assert_eq!(dataset.columns(), ["url", "title", "price"]);
    }

    #[test]
    fn test_new_columns_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("total_scrap.csv"));

        store.merge(&[listing("a", "1")]).unwrap();
        store
            .merge(&[ListingRecord::new("b").with("price", "2").with("floor", "3")])
            .unwrap();

        let dataset = store.load().unwrap();
        assert_eq!(dataset.columns(), ["url", "price", "floor"]);
        assert_eq!(dataset.get("a").unwrap().get("floor"), Some(""));
    }

    #[test]
    fn test_records_without_url_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("total_scrap.csv"));

        let report = store.merge(&[listing("", "1"), listing("a", "2")]).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.total, 1);
    }

    #[test]
    fn test_unreadable_dataset_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("total_scrap.csv");
        fs::write(&path, "title,price\nSomething,1\n").unwrap();
        let store = DatasetStore::new(&path);
        let now = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();

        assert!(store.merge_or_stash(&[listing("a", "1")], now).is_none());
        assert_eq!(fs::read_to_string(&path).unwrap(), "title,price\nSomething,1\n");

        let pending = dir.path().join("total_scrap.pending-20240301-103000.csv");
        let stashed = DatasetStore::new(pending).load().unwrap();
        assert_eq!(stashed.len(), 1);
    }

    #[test]
    fn test_most_common_ignores_placeholders() {
        let mut dataset = Dataset::default();
        for (url, loc) in [("a", "Kadıköy"), ("b", "N/A"), ("c", "Kadıköy"), ("d", "Beşiktaş")] {
            dataset.upsert(ListingRecord::new(url).with("location", loc));
        }
        assert_eq!(dataset.most_common("location"), Some(("Kadıköy".to_string(), 2)));
        assert_eq!(dataset.most_common("missing"), None);
    }
}
