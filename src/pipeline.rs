use chrono::NaiveDate;
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use crate::config::{SectorConfig, Settings};
use crate::error::{Result, RotationError};
use crate::lead_lag::{self, GrangerCell, GrangerTest, LeadLagMatrix};
use crate::momentum::{self, MomentumMethod, RotationPoint};
use crate::rank::{self, RankRow, VolatilityRanking};
use crate::relative_strength;
use crate::resample::Resampler;
use crate::returns;
use crate::series::{CumulativeReturnSeries, DateSeries, RelativeStrengthSeries, Timeframe};
use crate::source::PriceSource;
use crate::store::PriceStore;
use crate::updater::{UpdateOutcome, Updater};
use crate::volatility;

/// A ticker skipped by a batch operation, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickerError {
    pub ticker: String,
    pub message: String,
}

/// Partial result of a batch operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<T> {
    pub value: T,
    pub errors: Vec<TickerError>,
}

impl<T> BatchResult<T> {
    fn new(value: T, errors: Vec<TickerError>) -> Self {
        Self { value, errors }
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One-line status for a batch: the first three errors, or a success count.
pub fn status_summary(errors: &[TickerError], loaded: usize) -> String {
    if errors.is_empty() {
        return format!("Data loaded successfully - {loaded} tickers");
    }
    let shown = errors
        .iter()
        .take(3)
        .map(|e| format!("Error processing {}: {}", e.ticker, e.message))
        .collect::<Vec<_>>()
        .join("; ");
    let mut status = format!("Errors: {shown}");
    if errors.len() > 3 {
        status.push_str(&format!(" and {} more...", errors.len() - 3));
    }
    status
}

/// Update error of `ticker` or of the benchmark it is measured against.
fn refresh_error<'a>(
    failed: &'a BTreeMap<String, RotationError>,
    ticker: &str,
    benchmark: &str,
) -> Option<&'a RotationError> {
    failed.get(ticker).or_else(|| failed.get(benchmark))
}

fn record(errors: &mut Vec<TickerError>, ticker: &str, e: &RotationError) {
    warn!("Error processing {}: {}", ticker, e);
    errors.push(TickerError {
        ticker: ticker.to_string(),
        message: e.to_string(),
    });
}

/// Latest volatility z-score per timeframe; `None` where no value could be computed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolatilityRow {
    pub ticker: String,
    pub daily: Option<f64>,
    pub weekly: Option<f64>,
    pub monthly: Option<f64>,
}

impl VolatilityRow {
    pub fn get(&self, tf: Timeframe) -> Option<f64> {
        match tf {
            Timeframe::Daily => self.daily,
            Timeframe::Weekly => self.weekly,
            Timeframe::Monthly => self.monthly,
        }
    }
}

/// Last session versus the one before it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyChange {
    pub ticker: String,
    pub name: String,
    pub date: NaiveDate,
    pub last_close: f64,
    pub prev_close: f64,
    pub change: f64,
    /// Latest period return, as a fraction.
    pub change_pct: f64,
    pub volume: Option<f64>,
}

/// Rotation-graph tail for one sector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    pub ticker: String,
    pub points: Vec<RotationPoint>,
}

/// Computation API over the store. Loaders bring the daily store up to date,
/// regenerate a stale weekly/monthly pair, read the series and hand it to a
/// pure engine. Batch operations update each distinct ticker once, never abort
/// on one ticker, and return whatever succeeded plus a per-ticker error list.
pub struct Pipeline {
    config: SectorConfig,
    settings: Settings,
    store: PriceStore,
    source: Box<dyn PriceSource>,
}

impl Pipeline {
    pub fn new(config: SectorConfig, settings: Settings, source: Box<dyn PriceSource>) -> Result<Self> {
        config.validate()?;
        let store = PriceStore::open(&settings.data_dir)?;
        info!(
            "pipeline ready: {} tickers, store {}, source {}",
            config.all_tickers().len(),
            store.dir().display(),
            source.name()
        );
        Ok(Self {
            config,
            settings,
            store,
            source,
        })
    }

    pub fn config(&self) -> &SectorConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &PriceStore {
        &self.store
    }

    fn updater(&self) -> Updater<'_> {
        Updater::new(self.source.as_ref(), &self.store, &self.config, &self.settings)
    }

    /// Brings the stored daily series of `ticker` up to date.
    pub async fn refresh(&self, ticker: &str) -> Result<UpdateOutcome> {
        self.updater().ensure_fresh(ticker).await
    }

    /// Refreshes `ticker`; a failed vendor request falls back to stored data.
    async fn refresh_for_read(&self, ticker: &str) -> Result<()> {
        if let UpdateOutcome::FetchFailed { reason } = self.refresh(ticker).await? {
            warn!("{}: update failed ({}); using stored data", ticker, reason);
        }
        Ok(())
    }

    /// Refreshes each distinct ticker once, in order. Returns the tickers whose
    /// update errored.
    async fn refresh_each<'t>(
        &self,
        tickers: impl IntoIterator<Item = &'t str>,
    ) -> BTreeMap<String, RotationError> {
        let mut failed = BTreeMap::new();
        for ticker in tickers.into_iter().unique() {
            if let Err(e) = self.refresh_for_read(ticker).await {
                error!("{}: update errored: {}", ticker, e);
                failed.insert(ticker.to_string(), e);
            }
        }
        failed
    }

    /// Period returns of `ticker` at `tf`, fetching and resampling as needed.
    pub async fn returns(&self, ticker: &str, tf: Timeframe) -> Result<DateSeries> {
        self.refresh_for_read(ticker).await?;
        self.stored_returns(ticker, tf)
    }

    /// Period returns from the store alone. A stale weekly/monthly pair is
    /// regenerated; nothing is fetched.
    pub fn stored_returns(&self, ticker: &str, tf: Timeframe) -> Result<DateSeries> {
        let unavailable = || RotationError::DataUnavailable {
            ticker: ticker.to_string(),
            timeframe: tf,
        };
        if tf != Timeframe::Daily {
            if !self.store.has_returns(ticker, Timeframe::Daily) {
                return Err(unavailable());
            }
            Resampler::new(&self.store).resample(ticker, tf, self.config.is_synthetic(ticker), false)?;
        }
        match self.store.read_returns(ticker, tf)? {
            Some(series) if !series.is_empty() => Ok(series),
            _ => Err(unavailable()),
        }
    }

    pub async fn cumulative_returns(
        &self,
        ticker: &str,
        tf: Timeframe,
        lookback: Option<usize>,
    ) -> Result<CumulativeReturnSeries> {
        let series = self.returns(ticker, tf).await?;
        returns::cumulative_returns(&series, lookback)
    }

    fn stored_cumulative(&self, ticker: &str, tf: Timeframe) -> Result<CumulativeReturnSeries> {
        returns::cumulative_returns(&self.stored_returns(ticker, tf)?, None)
    }

    fn stored_relative_strength(
        &self,
        target: &str,
        benchmark: &str,
        tf: Timeframe,
        lookback: Option<usize>,
        normalize: bool,
    ) -> Result<RelativeStrengthSeries> {
        let target_cum = self.stored_cumulative(target, tf)?;
        let bench_cum = self.stored_cumulative(benchmark, tf)?;
        relative_strength::relative_strength(&target_cum, &bench_cum, lookback, normalize)
    }

    pub async fn relative_strength(
        &self,
        target: &str,
        benchmark: &str,
        tf: Timeframe,
        lookback: Option<usize>,
        normalize: bool,
    ) -> Result<RelativeStrengthSeries> {
        self.refresh_for_read(target).await?;
        self.refresh_for_read(benchmark).await?;
        self.stored_relative_strength(target, benchmark, tf, lookback, normalize)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn momentum(
        &self,
        target: &str,
        benchmark: &str,
        tf: Timeframe,
        lookback: usize,
        window: usize,
        normalize: bool,
        method: MomentumMethod,
    ) -> Result<f64> {
        let rs = self
            .relative_strength(target, benchmark, tf, Some(lookback), normalize)
            .await?;
        momentum::momentum(&rs, window, method)
    }

    /// Rolling slope over every trailing window of the relative-strength line.
    pub async fn momentum_series(
        &self,
        target: &str,
        benchmark: &str,
        tf: Timeframe,
        lookback: usize,
        window: usize,
        normalize: bool,
    ) -> Result<DateSeries> {
        let rs = self
            .relative_strength(target, benchmark, tf, Some(lookback), normalize)
            .await?;
        momentum::momentum_series(&rs, window, MomentumMethod::Slope)
    }

    /// Rotation-graph tails: relative strength over `lookback + window` periods,
    /// rolling slope momentum, last `window` points.
    pub async fn rotation_trajectories(
        &self,
        tickers: &[String],
        benchmark: &str,
        tf: Timeframe,
        lookback: usize,
        window: usize,
        normalize: bool,
    ) -> BatchResult<Vec<Trajectory>> {
        let failed = self
            .refresh_each(std::iter::once(benchmark).chain(tickers.iter().map(String::as_str)))
            .await;
        let mut out = vec![];
        let mut errors = vec![];
        for ticker in tickers.iter().filter(|t| *t != benchmark) {
            if let Some(e) = refresh_error(&failed, ticker, benchmark) {
                record(&mut errors, ticker, e);
                continue;
            }
            let res = self
                .stored_relative_strength(ticker, benchmark, tf, Some(lookback + window), normalize)
                .and_then(|rs| momentum::rotation_trajectory(&rs, window));
            match res {
                Ok(points) => out.push(Trajectory {
                    ticker: ticker.clone(),
                    points,
                }),
                Err(e) => record(&mut errors, ticker, &e),
            }
        }
        BatchResult::new(out, errors)
    }

    /// Latest volatility reading. `Ok(None)` when the history is too short for
    /// the window; load failures are errors.
    pub async fn volatility(
        &self,
        ticker: &str,
        tf: Timeframe,
        window: usize,
        raw: bool,
    ) -> Result<Option<f64>> {
        self.refresh_for_read(ticker).await?;
        self.stored_volatility(ticker, tf, window, raw)
    }

    fn stored_volatility(&self, ticker: &str, tf: Timeframe, window: usize, raw: bool) -> Result<Option<f64>> {
        let cum = self.stored_cumulative(ticker, tf)?;
        Ok(volatility::volatility(&cum, tf, window, raw))
    }

    /// Volatility z-scores across daily, weekly and monthly for every ticker.
    pub async fn volatility_table(&self, tickers: &[String], window: usize) -> BatchResult<Vec<VolatilityRow>> {
        let failed = self.refresh_each(tickers.iter().map(String::as_str)).await;
        let mut rows = vec![];
        let mut errors = vec![];
        for ticker in tickers {
            let mut by_tf = BTreeMap::new();
            if let Some(e) = failed.get(ticker) {
                record(&mut errors, ticker, e);
            } else {
                for tf in Timeframe::ALL {
                    match self.stored_volatility(ticker, tf, window, false) {
                        Ok(v) => {
                            by_tf.insert(tf, v);
                        }
                        Err(e) => {
                            error!("Error processing {} for {}: {}", ticker, tf, e);
                            errors.push(TickerError {
                                ticker: ticker.clone(),
                                message: format!("{tf}: {e}"),
                            });
                        }
                    }
                }
            }
            let get = |tf: Timeframe| by_tf.get(&tf).copied().flatten();
            rows.push(VolatilityRow {
                ticker: ticker.clone(),
                daily: get(Timeframe::Daily),
                weekly: get(Timeframe::Weekly),
                monthly: get(Timeframe::Monthly),
            });
        }
        BatchResult::new(rows, errors)
    }

    /// Sectors by latest relative strength, strongest first. The benchmark is skipped.
    pub async fn rank_relative_strength(
        &self,
        tickers: &[String],
        benchmark: &str,
        tf: Timeframe,
        lookback: usize,
        normalize: bool,
    ) -> BatchResult<Vec<RankRow>> {
        let failed = self
            .refresh_each(std::iter::once(benchmark).chain(tickers.iter().map(String::as_str)))
            .await;
        let mut values = vec![];
        let mut errors = vec![];
        for ticker in tickers.iter().filter(|t| *t != benchmark) {
            if let Some(e) = refresh_error(&failed, ticker, benchmark) {
                record(&mut errors, ticker, e);
                continue;
            }
            match self.stored_relative_strength(ticker, benchmark, tf, Some(lookback), normalize) {
                Ok(rs) => {
                    if let Some((_, last)) = rs.last() {
                        values.push((ticker.clone(), last));
                    }
                }
                Err(e) => record(&mut errors, ticker, &e),
            }
        }
        BatchResult::new(rank::rank_descending(values), errors)
    }

    /// Sectors by relative-strength momentum, strongest first. The benchmark is skipped.
    #[allow(clippy::too_many_arguments)]
    pub async fn rank_momentum(
        &self,
        tickers: &[String],
        benchmark: &str,
        tf: Timeframe,
        lookback: usize,
        window: usize,
        normalize: bool,
        method: MomentumMethod,
    ) -> BatchResult<Vec<RankRow>> {
        let failed = self
            .refresh_each(std::iter::once(benchmark).chain(tickers.iter().map(String::as_str)))
            .await;
        let mut values = vec![];
        let mut errors = vec![];
        for ticker in tickers.iter().filter(|t| *t != benchmark) {
            if let Some(e) = refresh_error(&failed, ticker, benchmark) {
                record(&mut errors, ticker, e);
                continue;
            }
            let res = self
                .stored_relative_strength(ticker, benchmark, tf, Some(lookback), normalize)
                .and_then(|rs| momentum::momentum(&rs, window, method));
            match res {
                Ok(m) => values.push((ticker.clone(), m)),
                Err(e) => record(&mut errors, ticker, &e),
            }
        }
        BatchResult::new(rank::rank_descending(values), errors)
    }

    /// Most volatile and most stable sectors per timeframe.
    pub async fn rank_volatility(&self, tickers: &[String], window: usize) -> BatchResult<Vec<VolatilityRanking>> {
        let table = self.volatility_table(tickers, window).await;
        let rankings = Timeframe::ALL
            .into_iter()
            .map(|tf| {
                let scores: Vec<(String, Option<f64>)> = table
                    .value
                    .iter()
                    .map(|row| (row.ticker.clone(), row.get(tf)))
                    .collect();
                VolatilityRanking::from_scores(tf, &scores)
            })
            .collect();
        BatchResult::new(rankings, table.errors)
    }

    /// Period returns for lead-lag work: percent change of the cumulative series.
    async fn lead_lag_returns(&self, tickers: &[String], tf: Timeframe) -> BatchResult<BTreeMap<String, DateSeries>> {
        let failed = self.refresh_each(tickers.iter().map(String::as_str)).await;
        let mut out = BTreeMap::new();
        let mut errors = vec![];
        for ticker in tickers {
            if let Some(e) = failed.get(ticker) {
                record(&mut errors, ticker, e);
                continue;
            }
            match self.stored_cumulative(ticker, tf) {
                Ok(cum) => {
                    out.insert(ticker.clone(), cum.pct_change().drop_non_finite());
                }
                Err(e) => record(&mut errors, ticker, &e),
            }
        }
        BatchResult::new(out, errors)
    }

    /// Best cross-correlation lag for every (leader, laggard) pair.
    pub async fn sector_lead_lag_matrix(
        &self,
        tickers: &[String],
        tf: Timeframe,
        max_lag: usize,
    ) -> BatchResult<LeadLagMatrix<Option<i64>>> {
        let returns = self.lead_lag_returns(tickers, tf).await;
        let matrix = lead_lag::cross_correlation_matrix(&returns.value, tickers, max_lag);
        BatchResult::new(matrix, returns.errors)
    }

    /// Minimum Granger p-value and its lag for every (leader, laggard) pair.
    pub async fn granger_lead_lag_matrix(
        &self,
        tickers: &[String],
        tf: Timeframe,
        max_lag: usize,
        test: GrangerTest,
    ) -> BatchResult<LeadLagMatrix<GrangerCell>> {
        let returns = self.lead_lag_returns(tickers, tf).await;
        let matrix = lead_lag::granger_matrix(&returns.value, tickers, max_lag, test);
        BatchResult::new(matrix, returns.errors)
    }

    /// Updates every tracked ticker and regenerates stale weekly/monthly series.
    pub async fn refresh_all(&self, force_resample: bool) -> BatchResult<Vec<(String, UpdateOutcome)>> {
        let mut outcomes = vec![];
        let mut errors = vec![];
        let resampler = Resampler::new(&self.store);
        for ticker in self.config.all_tickers() {
            let outcome = match self.refresh(&ticker).await {
                Ok(o) => o,
                Err(e) => {
                    record(&mut errors, &ticker, &e);
                    continue;
                }
            };
            if let UpdateOutcome::FetchFailed { reason } = &outcome {
                errors.push(TickerError {
                    ticker: ticker.clone(),
                    message: reason.clone(),
                });
            }
            if self.store.has_returns(&ticker, Timeframe::Daily) {
                for tf in [Timeframe::Weekly, Timeframe::Monthly] {
                    if let Err(e) =
                        resampler.resample(&ticker, tf, self.config.is_synthetic(&ticker), force_resample)
                    {
                        record(&mut errors, &ticker, &e);
                    }
                }
            }
            outcomes.push((ticker, outcome));
        }
        BatchResult::new(outcomes, errors)
    }

    /// Last close, previous close and latest change for every tracked ticker,
    /// benchmark first.
    pub async fn daily_changes(&self) -> BatchResult<Vec<DailyChange>> {
        let mut rows = vec![];
        let mut errors = vec![];
        for ticker in self.config.all_tickers() {
            match self.daily_change(&ticker).await {
                Ok(row) => rows.push(row),
                Err(e) => record(&mut errors, &ticker, &e),
            }
        }
        BatchResult::new(rows, errors)
    }

    async fn daily_change(&self, ticker: &str) -> Result<DailyChange> {
        let returns = self.returns(ticker, Timeframe::Daily).await?;
        let bars = self
            .store
            .read_bars(ticker, Timeframe::Daily)?
            .unwrap_or_default();
        let closes: Vec<_> = bars.iter().filter(|b| b.close.is_some()).collect();
        let [.., prev, last] = closes.as_slice() else {
            return Err(RotationError::insufficient(
                format!("daily change of {ticker}"),
                2,
                closes.len(),
            ));
        };
        let (Some(last_close), Some(prev_close)) = (last.close, prev.close) else {
            return Err(RotationError::InvalidSeries(format!("{ticker}: missing close")));
        };
        let (_, change_pct) = returns
            .last()
            .ok_or_else(|| RotationError::insufficient(format!("daily change of {ticker}"), 1, 0))?;
        Ok(DailyChange {
            ticker: ticker.to_string(),
            name: self.config.sector_name(ticker).to_string(),
            date: last.date,
            last_close,
            prev_close,
            change: last_close - prev_close,
            change_pct,
            volume: last.volume,
        })
    }
}
