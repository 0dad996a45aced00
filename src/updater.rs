use chrono::{Duration, NaiveDate};
use tracing::{error, info, warn};

use crate::config::{SectorConfig, Settings};
use crate::error::{Result, RotationError};
use crate::series::{Timeframe, returns_from_bars};
use crate::source::PriceSource;
use crate::store::PriceStore;
use crate::synthetic::SyntheticStitcher;

/// What `ensure_fresh` did for one ticker.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Stored data is within the freshness tolerance; nothing fetched.
    Fresh { last_date: NaiveDate },
    /// No usable history was stored; the full range was fetched and written.
    FullFetch { rows: usize },
    /// Missing suffix fetched and merged.
    Appended { rows: usize },
    /// The vendor had nothing newer than what is stored.
    NoNewData,
    /// The vendor request failed; stored state is unchanged.
    FetchFailed { reason: String },
}

/// Keeps the persisted daily series of a ticker current, fetching only what is missing.
pub struct Updater<'a> {
    source: &'a dyn PriceSource,
    store: &'a PriceStore,
    config: &'a SectorConfig,
    settings: &'a Settings,
}

impl<'a> Updater<'a> {
    pub fn new(
        source: &'a dyn PriceSource,
        store: &'a PriceStore,
        config: &'a SectorConfig,
        settings: &'a Settings,
    ) -> Self {
        Self {
            source,
            store,
            config,
            settings,
        }
    }

    pub async fn ensure_fresh(&self, ticker: &str) -> Result<UpdateOutcome> {
        self.ensure_fresh_as_of(ticker, self.settings.today()).await
    }

    /// Vendor failures are logged and reported as [`UpdateOutcome::FetchFailed`];
    /// only store I/O errors are returned as `Err`.
    pub async fn ensure_fresh_as_of(&self, ticker: &str, today: NaiveDate) -> Result<UpdateOutcome> {
        let existing = self.store.read_returns(ticker, Timeframe::Daily)?;
        let Some(last_date) = existing.as_ref().and_then(|s| s.last_date()) else {
            info!("{} has no stored history; fetching all data", ticker);
            return self.full_fetch(ticker, today).await;
        };

        if (today - last_date).num_days() <= self.settings.freshness_tolerance_days {
            info!("{} up-to-date through {}; skipping", ticker, last_date);
            return Ok(UpdateOutcome::Fresh { last_date });
        }

        let start = last_date + Duration::days(1);
        info!("{} stale (last {}); fetching {} .. {}", ticker, last_date, start, today);
        let bars = match self.source.daily_bars(ticker, start, today).await {
            Ok(bars) => bars,
            Err(e) => {
                error!("failed {}: {}", ticker, e);
                return Ok(UpdateOutcome::FetchFailed {
                    reason: e.to_string(),
                });
            }
        };
        if bars.is_empty() {
            info!("{} no new rows", ticker);
            return Ok(UpdateOutcome::NoNewData);
        }

        // Merge bars first so the return for `start` can use the stored prior close.
        self.store.merge_bars(ticker, Timeframe::Daily, &bars)?;
        let merged = self
            .store
            .read_bars(ticker, Timeframe::Daily)?
            .unwrap_or_default();
        let returns = returns_from_bars(&merged);
        let rows = self
            .store
            .merge_returns(ticker, Timeframe::Daily, &returns)?;
        if rows == 0 {
            info!("{} no new rows", ticker);
            return Ok(UpdateOutcome::NoNewData);
        }
        info!("{}: appended {} rows", ticker, rows);
        Ok(UpdateOutcome::Appended { rows })
    }

    /// Full history from the configured start date; replaces whatever is stored.
    async fn full_fetch(&self, ticker: &str, today: NaiveDate) -> Result<UpdateOutcome> {
        let start = self.settings.history_start;

        if let Some(basket) = self.config.basket(ticker) {
            info!("Handling {} (synthetic basket)...", ticker);
            let stitcher = SyntheticStitcher::new(self.source, self.store);
            return match stitcher.stitch(ticker, basket, start, today).await {
                Ok(report) => Ok(UpdateOutcome::FullFetch {
                    rows: report.rows_added,
                }),
                Err(e @ (RotationError::Fetch { .. } | RotationError::DataUnavailable { .. })) => {
                    error!("Error stitching synthetic history for {}: {}", ticker, e);
                    Ok(UpdateOutcome::FetchFailed {
                        reason: e.to_string(),
                    })
                }
                Err(e) => Err(e),
            };
        }

        let bars = match self.source.daily_bars(ticker, start, today).await {
            Ok(bars) => bars,
            Err(e) => {
                error!("Error fetching {}: {}", ticker, e);
                return Ok(UpdateOutcome::FetchFailed {
                    reason: e.to_string(),
                });
            }
        };
        if bars.is_empty() {
            warn!("Error: No data returned for {}", ticker);
            return Ok(UpdateOutcome::FetchFailed {
                reason: format!("no data returned for {ticker}"),
            });
        }

        let returns = returns_from_bars(&bars);
        self.store.write_bars(ticker, Timeframe::Daily, &bars)?;
        self.store.write_returns(ticker, Timeframe::Daily, &returns)?;
        info!("Saved: {}_daily ({} rows)", ticker, returns.len());
        Ok(UpdateOutcome::FullFetch {
            rows: returns.len(),
        })
    }
}
