//! File-backed stores. Both are single-writer and replace their file
//! atomically: write a temp file in the same directory, fsync, rename.

pub mod dataset;
pub mod progress;

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub use self::dataset::{DatasetStore, MergeReport};
pub use self::progress::ProgressStore;

pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(contents)?;
    temp.flush()?;
    temp.as_file_mut().sync_all()?;
    temp.into_temp_path().persist(path).map_err(|e| e.error)
}
