use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::config::SyntheticBasket;
use crate::error::{Result, RotationError};
use crate::series::{Bar, DateSeries, Timeframe, returns_from_bars};
use crate::source::PriceSource;
use crate::store::PriceStore;

/// Constituent adjusted closes on their common dates plus the renormalized weights.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSeries {
    pub dates: Vec<NaiveDate>,
    /// Constituent -> adjusted closes, parallel to `dates`.
    pub prices: BTreeMap<String, Vec<f64>>,
    /// Sums to 1 over the constituents present in `prices`.
    pub weights: BTreeMap<String, f64>,
}

impl SyntheticSeries {
    /// Inner-joins constituent closes on date and renormalizes weights over the survivors.
    pub fn build(
        closes: BTreeMap<String, DateSeries>,
        weights: &BTreeMap<String, f64>,
    ) -> Result<Self> {
        let present: BTreeMap<String, DateSeries> = closes
            .into_iter()
            .filter(|(t, s)| !s.is_empty() && weights.contains_key(t))
            .collect();
        if present.is_empty() {
            return Err(RotationError::Alignment(
                "no constituent of the synthetic basket returned data".into(),
            ));
        }

        let mut iter = present.values();
        let mut dates: Vec<NaiveDate> = iter.next().map(|s| s.dates().to_vec()).unwrap_or_default();
        for s in iter {
            dates.retain(|d| s.get(*d).is_some());
        }

        let prices = present
            .iter()
            .map(|(t, s)| {
                let col = dates.iter().filter_map(|d| s.get(*d)).collect();
                (t.clone(), col)
            })
            .collect();

        let total: f64 = present.keys().filter_map(|t| weights.get(t)).sum();
        let weights = present
            .keys()
            .filter_map(|t| weights.get(t).map(|w| (t.clone(), w / total)))
            .collect();

        Ok(Self {
            dates,
            prices,
            weights,
        })
    }

    /// Weighted sum of constituent period returns; the first common date is dropped.
    pub fn weighted_returns(&self) -> DateSeries {
        let mut pairs = Vec::with_capacity(self.dates.len().saturating_sub(1));
        for i in 1..self.dates.len() {
            let r: f64 = self
                .prices
                .iter()
                .map(|(t, px)| {
                    let w = self.weights.get(t).copied().unwrap_or(0.0);
                    w * (px[i] - px[i - 1]) / px[i - 1]
                })
                .sum();
            if r.is_finite() {
                pairs.push((self.dates[i], r));
            }
        }
        DateSeries::from_unsorted(pairs)
    }
}

/// What a stitch run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StitchReport {
    pub synthetic_rows: usize,
    pub real_rows: usize,
    pub constituents_used: usize,
    pub rows_added: usize,
}

/// Rebuilds daily history for an instrument launched or reclassified inside the
/// analysis window. Up to the cutover its returns are the weighted sum of
/// constituent returns; from the resumption date on they are its own
/// close-to-close returns.
pub struct SyntheticStitcher<'a> {
    source: &'a dyn PriceSource,
    store: &'a PriceStore,
}

impl<'a> SyntheticStitcher<'a> {
    pub fn new(source: &'a dyn PriceSource, store: &'a PriceStore) -> Self {
        Self { source, store }
    }

    /// Builds the daily return series for `ticker` over `[start, end]` and merges
    /// it into the store (existing rows win).
    pub async fn stitch(
        &self,
        ticker: &str,
        basket: &SyntheticBasket,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<StitchReport> {
        let (synthetic, constituents_used) = if start > basket.cutover {
            info!(
                "{}: range starts after cutover {}, skipping synthetic segment",
                ticker, basket.cutover
            );
            (DateSeries::default(), 0)
        } else {
            self.synthetic_segment(ticker, basket, start).await?
        };

        let real_start = if start > basket.cutover {
            start
        } else {
            basket.resumption
        };
        info!("Fetching real {} data non-synthetic from {}...", ticker, real_start);
        let real_bars = self.source.daily_bars(ticker, real_start, end).await?;
        let real = returns_from_bars(&real_bars);

        // Synthetic segment first, real segment after; the real segment owns any shared date.
        let stitched = match real.first() {
            Some((first_real, _)) => {
                let head = DateSeries::from_unsorted(
                    synthetic.iter().filter(|(d, _)| *d < first_real).collect(),
                );
                let (s, _) = real.merge_keep_existing(&head);
                s
            }
            None => synthetic.clone(),
        };

        if stitched.is_empty() {
            return Err(RotationError::DataUnavailable {
                ticker: ticker.to_string(),
                timeframe: Timeframe::Daily,
            });
        }

        // keep the real bars so later incremental updates have a prior close
        if !real_bars.is_empty() {
            self.store.merge_bars(ticker, Timeframe::Daily, &real_bars)?;
        }
        let rows_added = self.store.merge_returns(ticker, Timeframe::Daily, &stitched)?;
        info!(
            "Saved stitched {} returns: {} synthetic + {} real rows ({} new)",
            ticker,
            synthetic.len(),
            real.len(),
            rows_added
        );

        Ok(StitchReport {
            synthetic_rows: synthetic.len(),
            real_rows: real.len(),
            constituents_used,
            rows_added,
        })
    }

    async fn synthetic_segment(
        &self,
        ticker: &str,
        basket: &SyntheticBasket,
        start: NaiveDate,
    ) -> Result<(DateSeries, usize)> {
        let mut closes = BTreeMap::new();
        for constituent in basket.weights.keys() {
            info!("Fetching holding {}, part of {}...", constituent, ticker);
            match self
                .source
                .daily_bars(constituent, start, basket.cutover)
                .await
            {
                Ok(bars) => {
                    closes.insert(constituent.clone(), adjusted_closes(&bars));
                }
                Err(e) => warn!("Error fetching {}: {}", constituent, e),
            }
        }

        match SyntheticSeries::build(closes, &basket.weights) {
            Ok(basket_series) => {
                let used = basket_series.prices.len();
                Ok((basket_series.weighted_returns(), used))
            }
            Err(e) => {
                warn!("{}: synthetic segment unavailable ({}), using real history only", ticker, e);
                Ok((DateSeries::default(), 0))
            }
        }
    }
}

/// Adjusted close where present, falling back to close.
fn adjusted_closes(bars: &[Bar]) -> DateSeries {
    DateSeries::from_unsorted(
        bars.iter()
            .filter_map(|b| b.adj_close.or(b.close).map(|c| (b.date, c)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemorySource;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn series(points: &[(&str, f64)]) -> DateSeries {
        DateSeries::from_unsorted(points.iter().map(|(s, v)| (d(s), *v)).collect())
    }

    fn basket() -> SyntheticBasket {
        SyntheticBasket {
            weights: [("AAA".to_string(), 3.0), ("BBB".to_string(), 1.0), ("CCC".to_string(), 4.0)]
                .into_iter()
                .collect(),
            cutover: d("2024-01-05"),
            resumption: d("2024-01-08"),
        }
    }

    #[test]
    fn test_build_renormalizes_over_present_constituents() {
        let mut closes = BTreeMap::new();
        closes.insert("AAA".to_string(), series(&[("2024-01-02", 10.0), ("2024-01-03", 11.0)]));
        closes.insert("BBB".to_string(), series(&[("2024-01-02", 20.0), ("2024-01-03", 18.0)]));
        closes.insert("CCC".to_string(), DateSeries::default());
        let s = SyntheticSeries::build(closes, &basket().weights).unwrap();
        assert_eq!(s.weights.len(), 2);
        assert!((s.weights["AAA"] - 0.75).abs() < 1e-12);
        assert!((s.weights["BBB"] - 0.25).abs() < 1e-12);
        let r = s.weighted_returns();
        // 0.75 * 10% + 0.25 * -10%
        assert!((r.values()[0] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_build_uses_common_dates_only() {
        let mut closes = BTreeMap::new();
        closes.insert(
            "AAA".to_string(),
            series(&[("2024-01-02", 10.0), ("2024-01-03", 11.0), ("2024-01-04", 12.0)]),
        );
        closes.insert("BBB".to_string(), series(&[("2024-01-02", 20.0), ("2024-01-04", 22.0)]));
        let s = SyntheticSeries::build(closes, &basket().weights).unwrap();
        assert_eq!(s.dates, vec![d("2024-01-02"), d("2024-01-04")]);
        assert_eq!(s.prices["AAA"], vec![10.0, 12.0]);
    }

    #[tokio::test]
    async fn test_start_after_cutover_fetches_only_real_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceStore::open(dir.path()).unwrap();
        let src = InMemorySource::new();
        src.insert_closes("AAA", &[(d("2024-01-02"), 10.0), (d("2024-01-03"), 11.0)]);
        src.insert_closes(
            "XLX",
            &[(d("2024-01-08"), 50.0), (d("2024-01-09"), 51.0), (d("2024-01-10"), 52.0)],
        );

        let stitcher = SyntheticStitcher::new(&src, &store);
        let report = stitcher
            .stitch("XLX", &basket(), d("2024-01-08"), d("2024-01-10"))
            .await
            .unwrap();

        assert_eq!(report.synthetic_rows, 0);
        let requests = src.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].ticker, "XLX");
        assert_eq!(requests[0].start, d("2024-01-08"));

        let stored = store.read_returns("XLX", Timeframe::Daily).unwrap().unwrap();
        assert_eq!(stored.dates(), &[d("2024-01-09"), d("2024-01-10")]);
    }

    #[tokio::test]
    async fn test_stitch_keeps_stored_returns_on_shared_dates() {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceStore::open(dir.path()).unwrap();
        store
            .write_returns("XLX", Timeframe::Daily, &series(&[("2024-01-09", 0.5)]))
            .unwrap();
        let src = InMemorySource::new();
        src.insert_closes(
            "XLX",
            &[(d("2024-01-08"), 50.0), (d("2024-01-09"), 51.0), (d("2024-01-10"), 52.0)],
        );

        let report = SyntheticStitcher::new(&src, &store)
            .stitch("XLX", &basket(), d("2024-01-08"), d("2024-01-10"))
            .await
            .unwrap();

        assert_eq!(report.rows_added, 1);
        let stored = store.read_returns("XLX", Timeframe::Daily).unwrap().unwrap();
        assert_eq!(stored.get(d("2024-01-09")), Some(0.5));
        assert!((stored.get(d("2024-01-10")).unwrap() - (52.0 / 51.0 - 1.0)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_stitch_concatenates_synthetic_then_real() {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceStore::open(dir.path()).unwrap();
        let src = InMemorySource::new();
        src.insert_closes(
            "AAA",
            &[(d("2024-01-02"), 10.0), (d("2024-01-03"), 11.0), (d("2024-01-04"), 11.0)],
        );
        src.insert_closes(
            "BBB",
            &[(d("2024-01-02"), 10.0), (d("2024-01-03"), 10.0), (d("2024-01-04"), 12.0)],
        );
        src.fail("CCC");
        src.insert_closes(
            "XLX",
            &[(d("2024-01-08"), 100.0), (d("2024-01-09"), 101.0), (d("2024-01-10"), 99.99)],
        );

        let stitcher = SyntheticStitcher::new(&src, &store);
        let report = stitcher
            .stitch("XLX", &basket(), d("2024-01-02"), d("2024-01-10"))
            .await
            .unwrap();
        assert_eq!(report.constituents_used, 2);
        assert_eq!(report.synthetic_rows, 2);
        assert_eq!(report.real_rows, 2);

        let stored = store.read_returns("XLX", Timeframe::Daily).unwrap().unwrap();
        assert_eq!(
            stored.dates(),
            &[d("2024-01-03"), d("2024-01-04"), d("2024-01-09"), d("2024-01-10")]
        );
        // AAA +10% at 0.75, BBB flat at 0.25
        assert!((stored.values()[0] - 0.075).abs() < 1e-12);
        // AAA flat, BBB +20% at 0.25
        assert!((stored.values()[1] - 0.05).abs() < 1e-12);
        assert!((stored.values()[2] - 0.01).abs() < 1e-12);

        // real bars kept for incremental updates
        let bars = store.read_bars("XLX", Timeframe::Daily).unwrap().unwrap();
        assert_eq!(bars.first().map(|b| b.date), Some(d("2024-01-08")));
    }
}
