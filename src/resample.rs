use chrono::{Datelike, Duration, NaiveDate};
use itertools::Itertools;
use tracing::{info, warn};

use crate::error::{Result, RotationError};
use crate::series::{Bar, DateSeries, Timeframe, returns_from_bars};
use crate::store::{PriceStore, ResampleStamp};

/// Last calendar day of the bucket containing `date`: Sunday for weekly,
/// month end for monthly.
pub fn period_end(date: NaiveDate, tf: Timeframe) -> NaiveDate {
    match tf {
        Timeframe::Daily => date,
        Timeframe::Weekly => {
            date + Duration::days(6 - date.weekday().num_days_from_monday() as i64)
        }
        Timeframe::Monthly => {
            let (y, m) = if date.month() == 12 {
                (date.year() + 1, 1)
            } else {
                (date.year(), date.month() + 1)
            };
            NaiveDate::from_ymd_opt(y, m, 1)
                .map(|first| first - Duration::days(1))
                .unwrap_or(date)
        }
    }
}

/// OHLCV aggregation per bucket: first open, max high, min low, last close,
/// summed volume. Buckets lacking any of those fields are dropped.
pub fn resample_bars(bars: &[Bar], tf: Timeframe) -> Vec<Bar> {
    let mut sorted = bars.to_vec();
    sorted.sort_by_key(|b| b.date);

    let mut out = vec![];
    for (end, group) in &sorted.into_iter().chunk_by(|b| period_end(b.date, tf)) {
        let group: Vec<Bar> = group.collect();
        let open = group.iter().find_map(|b| b.open);
        let high = group.iter().filter_map(|b| b.high).reduce(f64::max);
        let low = group.iter().filter_map(|b| b.low).reduce(f64::min);
        let close = group.iter().rev().find_map(|b| b.close);
        let adj_close = group.iter().rev().find_map(|b| b.adj_close);
        let volume = group
            .iter()
            .filter_map(|b| b.volume)
            .reduce(|a, b| a + b);
        if let (Some(_), Some(_), Some(_), Some(_), Some(_)) = (open, high, low, close, volume) {
            out.push(Bar {
                date: end,
                open,
                high,
                low,
                close,
                adj_close,
                volume,
            });
        }
    }
    out
}

/// Running product of `1 + r` (not rebased).
pub fn compound(returns: &DateSeries) -> DateSeries {
    let mut acc = 1.0;
    returns.map(|r| {
        acc *= 1.0 + r;
        acc
    })
}

/// Last value per bucket, stamped with the bucket end date.
pub fn resample_last(series: &DateSeries, tf: Timeframe) -> DateSeries {
    let chunks = series.iter().chunk_by(|(d, _)| period_end(*d, tf));
    let pairs = chunks
        .into_iter()
        .filter_map(|(end, group)| group.last().map(|(_, v)| (end, v)))
        .collect();
    DateSeries::from_unsorted(pairs)
}

/// Compounding-correct resampling of a return stream: compound, take the last
/// cumulative value per bucket, convert back to period returns.
pub fn resample_returns(daily: &DateSeries, tf: Timeframe) -> DateSeries {
    resample_last(&compound(daily), tf).pct_change()
}

/// Derives weekly and monthly series from the stored daily series.
pub struct Resampler<'a> {
    store: &'a PriceStore,
}

impl<'a> Resampler<'a> {
    pub fn new(store: &'a PriceStore) -> Self {
        Self { store }
    }

    /// Whether the stored pair for `tf` was derived from the current daily series.
    pub fn is_current(&self, ticker: &str, tf: Timeframe, return_only: bool) -> Result<bool> {
        let outputs_exist = self.store.has_returns(ticker, tf)
            && (return_only || self.store.has_bars(ticker, tf));
        if !outputs_exist {
            return Ok(false);
        }
        let Some(daily) = self.store.read_returns(ticker, Timeframe::Daily)? else {
            return Ok(false);
        };
        Ok(self.store.read_stamp(ticker, tf)? == Some(ResampleStamp::of(&daily)))
    }

    /// Regenerates the `tf` pair unless it is current. `return_only` selects the
    /// compounding path used for synthetically reconstructed instruments.
    pub fn resample(
        &self,
        ticker: &str,
        tf: Timeframe,
        return_only: bool,
        force: bool,
    ) -> Result<bool> {
        if tf == Timeframe::Daily {
            return Err(RotationError::Unsupported(
                "resampling target must be weekly or monthly".into(),
            ));
        }
        if !force && self.is_current(ticker, tf, return_only)? {
            return Ok(false);
        }

        let unavailable = || RotationError::DataUnavailable {
            ticker: ticker.to_string(),
            timeframe: Timeframe::Daily,
        };
        let daily = self
            .store
            .read_returns(ticker, Timeframe::Daily)?
            .ok_or_else(unavailable)?;

        let returns = if return_only {
            resample_returns(&daily, tf)
        } else {
            let bars = self
                .store
                .read_bars(ticker, Timeframe::Daily)?
                .ok_or_else(unavailable)?;
            let resampled = resample_bars(&bars, tf);
            self.store.write_bars(ticker, tf, &resampled)?;
            returns_from_bars(&resampled)
        };

        if returns.is_empty() {
            warn!("Warning: No returns data generated for {} ({})", ticker, tf);
        }
        self.store.write_returns(ticker, tf, &returns)?;
        self.store
            .write_stamp(ticker, tf, &ResampleStamp::of(&daily))?;
        info!("Saved: {}_{} ({} rows)", ticker, tf, returns.len());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn bar(date: &str, o: f64, h: f64, l: f64, c: f64, v: f64) -> Bar {
        Bar {
            date: d(date),
            open: Some(o),
            high: Some(h),
            low: Some(l),
            close: Some(c),
            adj_close: None,
            volume: Some(v),
        }
    }

    #[test]
    fn test_period_end_boundaries() {
        // 2024-01-03 is a Wednesday
        assert_eq!(period_end(d("2024-01-03"), Timeframe::Weekly), d("2024-01-07"));
        assert_eq!(period_end(d("2024-01-07"), Timeframe::Weekly), d("2024-01-07"));
        assert_eq!(period_end(d("2024-01-08"), Timeframe::Weekly), d("2024-01-14"));
        assert_eq!(period_end(d("2024-02-10"), Timeframe::Monthly), d("2024-02-29"));
        assert_eq!(period_end(d("2023-12-01"), Timeframe::Monthly), d("2023-12-31"));
    }

    #[test]
    fn test_resample_bars_weekly_aggregation() {
        let bars = vec![
            bar("2024-01-02", 10.0, 12.0, 9.0, 11.0, 100.0),
            bar("2024-01-03", 11.0, 13.0, 10.0, 12.0, 150.0),
            bar("2024-01-05", 12.0, 12.5, 8.5, 9.0, 50.0),
            bar("2024-01-08", 9.0, 10.0, 8.0, 9.5, 10.0),
        ];
        let weekly = resample_bars(&bars, Timeframe::Weekly);
        assert_eq!(weekly.len(), 2);
        let w = &weekly[0];
        assert_eq!(w.date, d("2024-01-07"));
        assert_eq!(
            (w.open, w.high, w.low, w.close, w.volume),
            (Some(10.0), Some(13.0), Some(8.5), Some(9.0), Some(300.0))
        );
    }

    #[test]
    fn test_resample_bars_drops_incomplete_buckets() {
        let bars = vec![
            Bar::from_close(d("2024-01-02"), 10.0),
            bar("2024-01-08", 9.0, 10.0, 8.0, 9.5, 10.0),
        ];
        let weekly = resample_bars(&bars, Timeframe::Weekly);
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly[0].date, d("2024-01-14"));
    }

    #[test]
    fn test_compounded_monthly_matches_direct_compounding() {
        let mut pairs = vec![];
        let mut date = d("2024-01-02");
        let mut i = 0;
        while date <= d("2024-05-31") {
            if date.weekday().num_days_from_monday() < 5 {
                let r = ((i * 7919) % 23) as f64 / 1000.0 - 0.011;
                pairs.push((date, r));
                i += 1;
            }
            date += Duration::days(1);
        }
        let daily = DateSeries::from_unsorted(pairs);
        let monthly = resample_returns(&daily, Timeframe::Monthly);

        let direct = resample_last(&compound(&daily), Timeframe::Monthly);
        let from_monthly = compound(&monthly);
        assert_eq!(monthly.len(), direct.len() - 1);
        let base = direct.values()[0];
        for (i, (date, v)) in from_monthly.iter().enumerate() {
            assert_eq!(date, direct.dates()[i + 1]);
            assert!((v - direct.values()[i + 1] / base).abs() < 1e-12);
        }
    }

    #[test]
    fn test_resample_is_skipped_while_stamp_matches() {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceStore::open(dir.path()).unwrap();
        let bars = vec![
            bar("2024-01-02", 10.0, 12.0, 9.0, 11.0, 100.0),
            bar("2024-01-09", 11.0, 13.0, 10.0, 12.0, 150.0),
            bar("2024-01-16", 12.0, 12.5, 8.5, 9.0, 50.0),
        ];
        store.write_bars("XLF", Timeframe::Daily, &bars).unwrap();
        store
            .write_returns("XLF", Timeframe::Daily, &returns_from_bars(&bars))
            .unwrap();

        let resampler = Resampler::new(&store);
        assert!(resampler.resample("XLF", Timeframe::Weekly, false, false).unwrap());
        assert!(!resampler.resample("XLF", Timeframe::Weekly, false, false).unwrap());
        assert!(resampler.resample("XLF", Timeframe::Weekly, false, true).unwrap());

        // new daily data invalidates the weekly pair
        let mut more = bars.clone();
        more.push(bar("2024-01-23", 9.0, 10.0, 8.0, 9.9, 10.0));
        store.write_bars("XLF", Timeframe::Daily, &more).unwrap();
        store
            .write_returns("XLF", Timeframe::Daily, &returns_from_bars(&more))
            .unwrap();
        assert!(!resampler.is_current("XLF", Timeframe::Weekly, false).unwrap());
        assert!(resampler.resample("XLF", Timeframe::Weekly, false, false).unwrap());
        let weekly = store.read_returns("XLF", Timeframe::Weekly).unwrap().unwrap();
        assert_eq!(weekly.len(), 3);
    }

    #[test]
    fn test_resample_without_daily_is_data_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceStore::open(dir.path()).unwrap();
        let res = Resampler::new(&store).resample("XLB", Timeframe::Monthly, true, false);
        assert!(matches!(res, Err(RotationError::DataUnavailable { .. })));
    }
}
