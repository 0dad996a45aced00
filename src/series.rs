use chrono::NaiveDate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, str::FromStr};

use crate::error::{Result, RotationError};

/// Sampling frequency of a stored series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    Daily,
    Weekly,
    Monthly,
}

impl Timeframe {
    pub const ALL: [Timeframe; 3] = [Timeframe::Daily, Timeframe::Weekly, Timeframe::Monthly];

    /// Periods per year used to annualize volatility.
    pub fn periods_per_year(&self) -> f64 {
        match self {
            Timeframe::Daily => 252.0,
            Timeframe::Weekly => 52.0,
            Timeframe::Monthly => 12.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Daily => "daily",
            Timeframe::Weekly => "weekly",
            Timeframe::Monthly => "monthly",
        }
    }

    /// Unit used when printing lookbacks ("30 days back").
    pub fn unit(&self) -> &'static str {
        match self {
            Timeframe::Daily => "days",
            Timeframe::Weekly => "weeks",
            Timeframe::Monthly => "months",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = RotationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "daily" | "d" => Ok(Timeframe::Daily),
            "weekly" | "w" => Ok(Timeframe::Weekly),
            "monthly" | "m" => Ok(Timeframe::Monthly),
            other => Err(RotationError::Configuration(format!(
                "unknown timeframe '{other}' (expected daily, weekly or monthly)"
            ))),
        }
    }
}

/// One OHLCV row. Vendors do not always supply every field, so all but the date are optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub adj_close: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
}

impl Bar {
    pub fn from_close(date: NaiveDate, close: f64) -> Self {
        Bar {
            date,
            open: None,
            high: None,
            low: None,
            close: Some(close),
            adj_close: None,
            volume: None,
        }
    }
}

/// Ordered date -> value mapping. Dates are strictly increasing and unique.
///
/// This is the single container for return streams, cumulative series,
/// relative strength lines and rolling statistics.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DateSeries {
    dates: Vec<NaiveDate>,
    values: Vec<f64>,
}

/// Running product of `1 + r`, anchored at 1.0.
pub type CumulativeReturnSeries = DateSeries;
/// Target cumulative divided by benchmark cumulative.
pub type RelativeStrengthSeries = DateSeries;

impl DateSeries {
    pub fn new(dates: Vec<NaiveDate>, values: Vec<f64>) -> Result<Self> {
        if dates.len() != values.len() {
            return Err(RotationError::InvalidSeries(format!(
                "{} dates for {} values",
                dates.len(),
                values.len()
            )));
        }
        if let Some((a, b)) = dates.iter().tuple_windows().find(|(a, b)| a >= b) {
            return Err(RotationError::InvalidSeries(format!(
                "dates not strictly increasing at {a} -> {b}"
            )));
        }
        Ok(Self { dates, values })
    }

    /// Builds from unordered pairs; later duplicates are discarded.
    pub fn from_unsorted(mut pairs: Vec<(NaiveDate, f64)>) -> Self {
        pairs.sort_by_key(|(d, _)| *d);
        pairs.dedup_by_key(|(d, _)| *d);
        let (dates, values) = pairs.into_iter().unzip();
        Self { dates, values }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn first(&self) -> Option<(NaiveDate, f64)> {
        Some((*self.dates.first()?, *self.values.first()?))
    }

    pub fn last(&self) -> Option<(NaiveDate, f64)> {
        Some((*self.dates.last()?, *self.values.last()?))
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn get(&self, date: NaiveDate) -> Option<f64> {
        self.dates
            .binary_search(&date)
            .ok()
            .map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
        self.dates.iter().copied().zip(self.values.iter().copied())
    }

    /// Trailing `n` observations (the whole series if shorter).
    pub fn tail(&self, n: usize) -> Self {
        let start = self.len().saturating_sub(n);
        Self {
            dates: self.dates[start..].to_vec(),
            values: self.values[start..].to_vec(),
        }
    }

    pub fn map(&self, mut f: impl FnMut(f64) -> f64) -> Self {
        Self {
            dates: self.dates.clone(),
            values: self.values.iter().map(|v| f(*v)).collect(),
        }
    }

    /// Period-over-period fractional change; the first observation is dropped.
    pub fn pct_change(&self) -> Self {
        let mut dates = Vec::with_capacity(self.len().saturating_sub(1));
        let mut values = Vec::with_capacity(self.len().saturating_sub(1));
        for ((_, prev), (d, next)) in self.iter().tuple_windows() {
            dates.push(d);
            values.push((next - prev) / prev);
        }
        Self { dates, values }
    }

    /// Keeps only finite values.
    pub fn drop_non_finite(&self) -> Self {
        let (dates, values) = self.iter().filter(|(_, v)| v.is_finite()).unzip();
        Self { dates, values }
    }

    /// Merge where existing rows win: rows of `newer` whose date is already present are ignored.
    pub fn merge_keep_existing(&self, newer: &DateSeries) -> (Self, usize) {
        let mut pairs: Vec<(NaiveDate, f64)> = self.iter().collect();
        let mut added = 0;
        for (d, v) in newer.iter() {
            if self.get(d).is_none() {
                pairs.push((d, v));
                added += 1;
            }
        }
        (Self::from_unsorted(pairs), added)
    }
}

/// Close-to-close returns for a bar history sorted by date. Bars without a close are skipped.
pub fn returns_from_bars(bars: &[Bar]) -> DateSeries {
    let closes = DateSeries::from_unsorted(
        bars.iter()
            .filter_map(|b| b.close.map(|c| (b.date, c)))
            .collect(),
    );
    closes.pct_change().drop_non_finite()
}

/// Merge bar histories; bars in `newer` whose date already exists are dropped.
pub fn merge_bars(existing: &[Bar], newer: &[Bar]) -> (Vec<Bar>, usize) {
    let mut known: BTreeSet<NaiveDate> = existing.iter().map(|b| b.date).collect();
    let mut merged = existing.to_vec();
    let mut added = 0;
    for bar in newer {
        if known.insert(bar.date) {
            merged.push(bar.clone());
            added += 1;
        }
    }
    merged.sort_by_key(|b| b.date);
    (merged, added)
}

/// Align two series on the union of their dates, forward-filling gaps,
/// then dropping rows where either side is still missing.
pub fn align_forward_fill(a: &DateSeries, b: &DateSeries) -> Vec<(NaiveDate, f64, f64)> {
    let union: BTreeSet<NaiveDate> = a.dates().iter().chain(b.dates()).copied().collect();
    let mut last_a: Option<f64> = None;
    let mut last_b: Option<f64> = None;
    let mut out = Vec::with_capacity(union.len());
    for d in union {
        if let Some(v) = a.get(d) {
            last_a = Some(v);
        }
        if let Some(v) = b.get(d) {
            last_b = Some(v);
        }
        if let (Some(x), Some(y)) = (last_a, last_b) {
            out.push((d, x, y));
        }
    }
    out
}

/// Inner join on dates present in both series.
pub fn intersect(a: &DateSeries, b: &DateSeries) -> (Vec<NaiveDate>, Vec<f64>, Vec<f64>) {
    let mut dates = Vec::new();
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for (d, x) in a.iter() {
        if let Some(y) = b.get(d) {
            dates.push(d);
            xs.push(x);
            ys.push(y);
        }
    }
    (dates, xs, ys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_new_rejects_unordered_dates() {
        let res = DateSeries::new(vec![d("2024-01-03"), d("2024-01-02")], vec![1.0, 2.0]);
        assert!(matches!(res, Err(RotationError::InvalidSeries(_))));
        let dup = DateSeries::new(vec![d("2024-01-02"), d("2024-01-02")], vec![1.0, 2.0]);
        assert!(dup.is_err());
    }

    #[test]
    fn test_pct_change_drops_first() {
        let s = DateSeries::new(
            vec![d("2024-01-02"), d("2024-01-03"), d("2024-01-04")],
            vec![100.0, 110.0, 99.0],
        )
        .unwrap();
        let r = s.pct_change();
        assert_eq!(r.dates(), &[d("2024-01-03"), d("2024-01-04")]);
        assert!((r.values()[0] - 0.10).abs() < 1e-12);
        assert!((r.values()[1] + 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_merge_keeps_existing_value() {
        let old = DateSeries::new(vec![d("2024-01-02"), d("2024-01-03")], vec![0.01, 0.02]).unwrap();
        let new = DateSeries::new(vec![d("2024-01-03"), d("2024-01-04")], vec![0.99, 0.03]).unwrap();
        let (merged, added) = old.merge_keep_existing(&new);
        assert_eq!(added, 1);
        assert_eq!(merged.get(d("2024-01-03")), Some(0.02));
        assert_eq!(merged.get(d("2024-01-04")), Some(0.03));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_align_forward_fill_bridges_gaps() {
        let a = DateSeries::new(vec![d("2024-01-02"), d("2024-01-03"), d("2024-01-04")], vec![1.0, 1.1, 1.2])
            .unwrap();
        let b = DateSeries::new(vec![d("2024-01-03"), d("2024-01-05")], vec![2.0, 2.5]).unwrap();
        let rows = align_forward_fill(&a, &b);
        // 01-02 dropped (b missing), 01-04 forward-fills b, 01-05 forward-fills a
        assert_eq!(
            rows,
            vec![
                (d("2024-01-03"), 1.1, 2.0),
                (d("2024-01-04"), 1.2, 2.0),
                (d("2024-01-05"), 1.2, 2.5),
            ]
        );
    }

    #[test]
    fn test_merge_bars_old_wins() {
        let old = vec![Bar::from_close(d("2024-01-02"), 10.0)];
        let new = vec![Bar::from_close(d("2024-01-02"), 99.0), Bar::from_close(d("2024-01-03"), 11.0)];
        let (merged, added) = merge_bars(&old, &new);
        assert_eq!(added, 1);
        assert_eq!(merged[0].close, Some(10.0));
        assert_eq!(merged[1].date, d("2024-01-03"));
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!("Weekly".parse::<Timeframe>().unwrap(), Timeframe::Weekly);
        assert!("hourly".parse::<Timeframe>().is_err());
    }
}
