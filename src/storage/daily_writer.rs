//! Append-only daily CSV files.
//!
//! One file per node per local calendar day, named `<node_id>_<YYYY-MM-DD>.csv`.
//! Every row is flushed and synced before `write` returns, so a power cut
//! loses at most the row being written.

use crate::config::WriterConfig;
use crate::core::row::{header_line, Row};
use chrono::NaiveDate;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Errors surfaced by the writer after local recovery has been tried.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("giving up on {} after {attempts} attempts: {source}", .path.display())]
    Exhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// File name for `node_id` on `date`.
pub fn daily_file_name(node_id: &str, date: NaiveDate) -> String {
    format!("{node_id}_{}.csv", date.format("%Y-%m-%d"))
}

struct OpenDay {
    date: NaiveDate,
    path: PathBuf,
    file: File,
}

/// Owns the currently open daily file and rotates on local date change.
pub struct DailyWriter {
    dir: PathBuf,
    node_id: String,
    retry: WriterConfig,
    current: Option<OpenDay>,
}

impl DailyWriter {
    pub fn new(dir: impl Into<PathBuf>, node_id: impl Into<String>, retry: WriterConfig) -> Self {
        Self {
            dir: dir.into(),
            node_id: node_id.into(),
            retry,
            current: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(daily_file_name(&self.node_id, date))
    }

    /// Date of the file currently bound, if any.
    pub fn current_date(&self) -> Option<NaiveDate> {
        self.current.as_ref().map(|day| day.date)
    }

    /// Append `row` to the file for its local date, retrying with backoff.
    pub fn write(&mut self, row: &Row) -> Result<(), WriterError> {
        let date = row.local_date();
        let line = row.to_csv_line();
        let max_attempts = self.retry.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.try_write(date, line.as_bytes()) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= max_attempts => {
                    let path = self.path_for(date);
                    error!(path = %path.display(), attempts = attempt, error = %e, "write retries exhausted");
                    self.current = None;
                    return Err(WriterError::Exhausted {
                        path,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "row write failed; reopening"
                    );
                    // Drop the handle so the next attempt starts from a fresh open.
                    self.current = None;
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Flush and release the open file.
    pub fn close(&mut self) -> Result<(), WriterError> {
        if let Some(day) = self.current.take() {
            sync(&day.file).map_err(|source| WriterError::Io {
                path: day.path.clone(),
                source,
            })?;
            info!(path = %day.path.display(), "closed daily file");
        }
        Ok(())
    }

    fn try_write(&mut self, date: NaiveDate, line: &[u8]) -> io::Result<()> {
        if self.current_date() != Some(date) {
            self.rotate(date)?;
        }
        let Some(day) = self.current.as_mut() else {
            return Err(io::Error::other("no daily file open"));
        };
        day.file.write_all(line)?;
        sync(&day.file)
    }

    fn rotate(&mut self, date: NaiveDate) -> io::Result<()> {
        if let Some(previous) = self.current.take() {
            // Best effort; the row it belonged to was already synced.
            if let Err(e) = sync(&previous.file) {
                warn!(path = %previous.path.display(), error = %e, "sync on rotation failed");
            }
            info!(from = %previous.date, to = %date, "rotating daily file");
        }
        let path = self.path_for(date);
        let file = open_daily(&self.dir, &path)?;
        self.current = Some(OpenDay { date, path, file });
        Ok(())
    }
}

impl Drop for DailyWriter {
    fn drop(&mut self) {
        if let Some(day) = self.current.take() {
            let _ = sync(&day.file);
        }
    }
}

fn sync(file: &File) -> io::Result<()> {
    let mut handle = file;
    handle.flush()?;
    file.sync_data()
}

/// Open `path` for appending, writing the header into new or empty files and
/// terminating a torn last line left by an interrupted write.
fn open_daily(dir: &Path, path: &Path) -> io::Result<File> {
    std::fs::create_dir_all(dir)?;
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;

    let header = header_line();
    let len = file.metadata()?.len();
    if len == 0 {
        file.write_all(header.as_bytes())?;
        sync(&file)?;
        info!(path = %path.display(), "created daily file");
        return Ok(file);
    }

    let mut first = String::new();
    BufReader::new(&file).read_line(&mut first)?;
    if first.trim_end() != header.trim_end() {
        warn!(path = %path.display(), "existing header differs from current column layout");
    }

    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        warn!(path = %path.display(), "repairing torn final line");
        file.write_all(b"\n")?;
        sync(&file)?;
    }
    info!(path = %path.display(), bytes = len, "appending to daily file");
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agreement::AgreementResult;
    use crate::core::row::COLUMNS;
    use crate::sensors::{Reading, TickReadings};
    use chrono::{TimeZone, Utc};
    use chrono_tz::Tz;
    use tempfile::TempDir;

    fn row_at(utc: chrono::DateTime<Utc>, tz: Tz) -> Row {
        Row {
            timestamp_utc: utc,
            timestamp_local: utc.with_timezone(&tz),
            node_id: "n1".into(),
            readings: TickReadings {
                climate: Reading::NoData,
                pms1: Reading::NoData,
                pms2: Reading::NoData,
                gas: Reading::NoData,
            },
            agreement: AgreementResult::incomplete(),
        }
    }

    fn fast_retry(max_attempts: u32) -> WriterConfig {
        WriterConfig {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let mut writer = DailyWriter::new(dir.path(), "n1", fast_retry(3));
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        writer.write(&row_at(t, Tz::UTC)).unwrap();
        writer.write(&row_at(t, Tz::UTC)).unwrap();
        writer.close().unwrap();

        // a restart appends to the same file without a second header
        let mut writer = DailyWriter::new(dir.path(), "n1", fast_retry(3));
        writer.write(&row_at(t, Tz::UTC)).unwrap();
        writer.close().unwrap();

        let path = dir.path().join("n1_2024-05-01.csv");
        let content = lines(&path);
        assert_eq!(content.len(), 4);
        assert_eq!(content[0], COLUMNS.join(","));
        assert_eq!(content.iter().filter(|l| l.starts_with("timestamp_utc")).count(), 1);
    }

    #[test]
    fn test_rotation_uses_local_date() {
        let dir = TempDir::new().unwrap();
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let mut writer = DailyWriter::new(dir.path(), "n1", fast_retry(3));

        // 14:59:59Z and 15:00:00Z straddle midnight in Tokyo (UTC+9)
        let before = Utc.with_ymd_and_hms(2024, 5, 1, 14, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap();
        writer.write(&row_at(before, tz)).unwrap();
        writer.write(&row_at(after, tz)).unwrap();
        assert_eq!(writer.current_date(), NaiveDate::from_ymd_opt(2024, 5, 2));
        writer.close().unwrap();

        let first = lines(&dir.path().join("n1_2024-05-01.csv"));
        let second = lines(&dir.path().join("n1_2024-05-02.csv"));
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(second[0].starts_with("timestamp_utc"));
    }

    #[test]
    fn test_empty_existing_file_gets_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("n1_2024-05-01.csv");
        std::fs::write(&path, "").unwrap();

        let mut writer = DailyWriter::new(dir.path(), "n1", fast_retry(1));
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 1).unwrap();
        writer.write(&row_at(t, Tz::UTC)).unwrap();
        writer.close().unwrap();

        let content = lines(&path);
        assert_eq!(content.len(), 2);
        assert!(content[0].starts_with("timestamp_utc,timestamp_local,node_id"));
    }

    #[test]
    fn test_torn_tail_is_terminated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("n1_2024-05-01.csv");
        std::fs::write(&path, format!("{}2024-05-01T00:00:00.000Z,2024-05", header_line())).unwrap();

        let mut writer = DailyWriter::new(dir.path(), "n1", fast_retry(1));
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 1).unwrap();
        writer.write(&row_at(t, Tz::UTC)).unwrap();
        writer.close().unwrap();

        let content = lines(&path);
        assert_eq!(content.len(), 3);
        assert_eq!(content[1], "2024-05-01T00:00:00.000Z,2024-05");
        assert!(content[2].starts_with("2024-05-01T00:00:01.000Z,"));
        assert_eq!(content[2].split(',').count(), COLUMNS.len());
    }

    #[test]
    fn test_unwritable_directory_exhausts_retries() {
        let dir = TempDir::new().unwrap();
        // a regular file where the data directory should be
        let blocker = dir.path().join("daily");
        std::fs::write(&blocker, "x").unwrap();

        let mut writer = DailyWriter::new(&blocker, "n1", fast_retry(3));
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        match writer.write(&row_at(t, Tz::UTC)) {
            Err(WriterError::Exhausted { attempts, path, .. }) => {
                assert_eq!(attempts, 3);
                assert!(path.ends_with("n1_2024-05-01.csv"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(writer.current_date(), None);
    }

    #[test]
    fn test_retry_recovers_after_transient_failure() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("daily");
        std::fs::write(&data_dir, "x").unwrap();

        // The blocker disappears while the writer waits out its first backoff.
        let blocker = data_dir.clone();
        let unblock = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            std::fs::remove_file(blocker).unwrap();
        });

        let retry = WriterConfig {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 500,
        };
        let mut writer = DailyWriter::new(&data_dir, "n1", retry);
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        writer.write(&row_at(t, Tz::UTC)).unwrap();
        writer.close().unwrap();
        unblock.join().unwrap();

        let content = lines(&data_dir.join("n1_2024-05-01.csv"));
        assert_eq!(content.len(), 2);
        assert_eq!(content[0], COLUMNS.join(","));
        assert!(content[1].starts_with("2024-05-01T00:00:00.000Z,"));
    }

    #[test]
    fn test_file_name_format() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 9).unwrap();
        assert_eq!(daily_file_name("roof-2", date), "roof-2_2024-01-09.csv");
    }
}
