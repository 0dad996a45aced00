use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use fs2::FileExt; // for file locking
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Result, RotationError};
use crate::series::{Bar, DateSeries, Timeframe, merge_bars};

/// Provenance of a resampled pair: which daily series it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResampleStamp {
    pub source_last_date: Option<NaiveDate>,
    pub source_rows: usize,
}

impl ResampleStamp {
    pub fn of(series: &DateSeries) -> Self {
        Self {
            source_last_date: series.last_date(),
            source_rows: series.len(),
        }
    }
}

#[derive(Serialize)]
struct ReturnRow {
    date: NaiveDate,
    #[serde(rename = "return")]
    value: f64,
}

/// File-backed per-ticker, per-timeframe series.
///
/// Layout: `{TICKER}_{timeframe}_raw.csv` (bars) and `{TICKER}_{timeframe}.csv`
/// (returns). Every write goes to a temp file in the same directory and is then
/// renamed over the target, so a crash leaves the previous file intact.
#[derive(Debug, Clone)]
pub struct PriceStore {
    dir: PathBuf,
}

impl PriceStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn raw_path(&self, ticker: &str, tf: Timeframe) -> PathBuf {
        self.dir.join(format!("{ticker}_{tf}_raw.csv"))
    }

    pub fn returns_path(&self, ticker: &str, tf: Timeframe) -> PathBuf {
        self.dir.join(format!("{ticker}_{tf}.csv"))
    }

    pub fn stamp_path(&self, ticker: &str, tf: Timeframe) -> PathBuf {
        self.dir.join(format!("{ticker}_{tf}.stamp.json"))
    }

    pub fn has_returns(&self, ticker: &str, tf: Timeframe) -> bool {
        self.returns_path(ticker, tf).exists()
    }

    pub fn has_bars(&self, ticker: &str, tf: Timeframe) -> bool {
        self.raw_path(ticker, tf).exists()
    }

    /// `None` when the file does not exist.
    pub fn read_bars(&self, ticker: &str, tf: Timeframe) -> Result<Option<Vec<Bar>>> {
        let path = self.raw_path(ticker, tf);
        if !path.exists() {
            return Ok(None);
        }
        let mut rdr = ReaderBuilder::new().trim(csv::Trim::All).from_path(&path)?;
        let headers = rdr.headers()?.clone();
        let date_col = date_column(&headers);
        let col = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.iter().any(|n| h.eq_ignore_ascii_case(n)))
        };
        let open = col(&["open"]);
        let high = col(&["high"]);
        let low = col(&["low"]);
        let close = col(&["close"]);
        let adj_close = col(&["adj_close", "adjclose"]);
        let volume = col(&["volume"]);

        let mut bars = Vec::new();
        for rec in rdr.records() {
            let r = rec?;
            let Some(date) = parse_date(r.get(date_col)) else {
                continue;
            };
            bars.push(Bar {
                date,
                open: field(&r, open),
                high: field(&r, high),
                low: field(&r, low),
                close: field(&r, close),
                adj_close: field(&r, adj_close),
                volume: field(&r, volume),
            });
        }
        bars.sort_by_key(|b| b.date);
        bars.dedup_by_key(|b| b.date);
        Ok(Some(bars))
    }

    pub fn write_bars(&self, ticker: &str, tf: Timeframe, bars: &[Bar]) -> Result<()> {
        let path = self.raw_path(ticker, tf);
        self.replace_atomically(&path, |wtr| {
            if bars.is_empty() {
                wtr.write_record(["date", "open", "high", "low", "close", "adj_close", "volume"])?;
            }
            for b in bars {
                wtr.serialize(b)?;
            }
            Ok(())
        })?;
        debug!("wrote {} bars to {}", bars.len(), path.display());
        Ok(())
    }

    /// `None` when the file does not exist.
    pub fn read_returns(&self, ticker: &str, tf: Timeframe) -> Result<Option<DateSeries>> {
        let path = self.returns_path(ticker, tf);
        if !path.exists() {
            return Ok(None);
        }
        let mut rdr = ReaderBuilder::new().trim(csv::Trim::All).from_path(&path)?;
        let headers = rdr.headers()?.clone();
        let date_col = date_column(&headers);
        let value_col = (0..headers.len()).find(|i| *i != date_col);

        let mut pairs = Vec::new();
        for rec in rdr.records() {
            let r = rec?;
            let (Some(date), Some(value)) = (parse_date(r.get(date_col)), field(&r, value_col))
            else {
                continue;
            };
            pairs.push((date, value));
        }
        Ok(Some(DateSeries::from_unsorted(pairs)))
    }

    pub fn write_returns(&self, ticker: &str, tf: Timeframe, series: &DateSeries) -> Result<()> {
        let path = self.returns_path(ticker, tf);
        self.replace_atomically(&path, |wtr| {
            if series.is_empty() {
                wtr.write_record(["date", "return"])?;
            }
            for (date, value) in series.iter() {
                wtr.serialize(ReturnRow { date, value })?;
            }
            Ok(())
        })?;
        debug!("wrote {} returns to {}", series.len(), path.display());
        Ok(())
    }

    /// Old-wins merge of bars. The file is rewritten only if something was added.
    pub fn merge_bars(&self, ticker: &str, tf: Timeframe, newer: &[Bar]) -> Result<usize> {
        let existing = self.read_bars(ticker, tf)?.unwrap_or_default();
        let (merged, added) = merge_bars(&existing, newer);
        if added > 0 || !self.has_bars(ticker, tf) {
            self.write_bars(ticker, tf, &merged)?;
        }
        Ok(added)
    }

    /// Old-wins merge of returns. The file is rewritten only if something was added.
    pub fn merge_returns(&self, ticker: &str, tf: Timeframe, newer: &DateSeries) -> Result<usize> {
        let existing = self.read_returns(ticker, tf)?.unwrap_or_default();
        let (merged, added) = existing.merge_keep_existing(newer);
        if added > 0 || !self.has_returns(ticker, tf) {
            self.write_returns(ticker, tf, &merged)?;
        }
        Ok(added)
    }

    pub fn read_stamp(&self, ticker: &str, tf: Timeframe) -> Result<Option<ResampleStamp>> {
        let path = self.stamp_path(ticker, tf);
        if !path.exists() {
            return Ok(None);
        }
        Ok(serde_json::from_slice(&fs::read(path)?).ok())
    }

    pub fn write_stamp(&self, ticker: &str, tf: Timeframe, stamp: &ResampleStamp) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), stamp)?;
        tmp.persist(self.stamp_path(ticker, tf))?;
        Ok(())
    }

    fn replace_atomically(
        &self,
        path: &Path,
        write: impl FnOnce(&mut csv::Writer<&mut fs::File>) -> Result<()>,
    ) -> Result<()> {
        // write fresh file to temp, then rename
        let mut tmp = NamedTempFile::new_in(path.parent().unwrap_or(&self.dir))?;
        {
            let mut wtr = WriterBuilder::new().from_writer(tmp.as_file_mut());
            write(&mut wtr)?;
            wtr.flush()?;
        }
        tmp.persist(path)?;
        Ok(())
    }
}

fn date_column(headers: &StringRecord) -> usize {
    headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("date"))
        .unwrap_or(0)
}

fn parse_date(s: Option<&str>) -> Option<NaiveDate> {
    let s = s?;
    // tolerate full timestamps ("2024-01-05T00:00:00.000Z", "2024-01-05 00:00:00")
    NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d").ok()
}

fn field(rec: &StringRecord, idx: Option<usize>) -> Option<f64> {
    rec.get(idx?)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| !v.is_nan())
}

/// Acquire an exclusive file lock; keep the file handle alive to hold the lock.
pub fn acquire_lock(lock_path: &Path) -> Result<fs::File> {
    fs::create_dir_all(lock_path.parent().unwrap_or(Path::new("."))).ok();
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(lock_path)?;
    file.try_lock_exclusive()
        .map_err(|source| RotationError::Locked {
            path: lock_path.display().to_string(),
            source,
        })?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_missing_files_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceStore::open(dir.path()).unwrap();
        assert!(store.read_bars("XLK", Timeframe::Daily).unwrap().is_none());
        assert!(store.read_returns("XLK", Timeframe::Daily).unwrap().is_none());
    }

    #[test]
    fn test_bars_survive_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceStore::open(dir.path()).unwrap();
        let bars = vec![
            Bar {
                date: d("2024-01-02"),
                open: Some(10.0),
                high: Some(11.0),
                low: Some(9.5),
                close: Some(10.5),
                adj_close: None,
                volume: Some(1200.0),
            },
            Bar::from_close(d("2024-01-03"), 10.75),
        ];
        store.write_bars("XLK", Timeframe::Daily, &bars).unwrap();
        let back = store.read_bars("XLK", Timeframe::Daily).unwrap().unwrap();
        assert_eq!(back, bars);
    }

    #[test]
    fn test_reads_date_indexed_file_with_foreign_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceStore::open(dir.path()).unwrap();
        fs::write(
            store.returns_path("SPY", Timeframe::Daily),
            "Timestamp,SPY\n2024-01-03T00:00:00.000Z,0.01\n2024-01-02,0.02\n",
        )
        .unwrap();
        let s = store.read_returns("SPY", Timeframe::Daily).unwrap().unwrap();
        assert_eq!(s.dates(), &[d("2024-01-02"), d("2024-01-03")]);
        assert_eq!(s.values(), &[0.02, 0.01]);
    }

    #[test]
    fn test_merge_returns_without_new_rows_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceStore::open(dir.path()).unwrap();
        let s = DateSeries::new(vec![d("2024-01-02"), d("2024-01-03")], vec![0.01, -0.005]).unwrap();
        store.write_returns("XLE", Timeframe::Daily, &s).unwrap();
        let before = fs::read(store.returns_path("XLE", Timeframe::Daily)).unwrap();

        let overlap = DateSeries::new(vec![d("2024-01-03")], vec![0.5]).unwrap();
        let added = store.merge_returns("XLE", Timeframe::Daily, &overlap).unwrap();
        assert_eq!(added, 0);
        let after = fs::read(store.returns_path("XLE", Timeframe::Daily)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_stamp_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceStore::open(dir.path()).unwrap();
        let stamp = ResampleStamp {
            source_last_date: Some(d("2024-02-29")),
            source_rows: 42,
        };
        store.write_stamp("XLU", Timeframe::Monthly, &stamp).unwrap();
        assert_eq!(store.read_stamp("XLU", Timeframe::Monthly).unwrap(), Some(stamp));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        let held = acquire_lock(&path).unwrap();
        let err = acquire_lock(&path).unwrap_err();
        assert!(matches!(err, RotationError::Locked { .. }), "{err}");
        drop(held);
        assert!(acquire_lock(&path).is_ok());
    }
}
