use statrs::statistics::Statistics;

use crate::series::{CumulativeReturnSeries, DateSeries, Timeframe};

/// Sample standard deviation over each trailing `window`, dated by the window end.
pub fn rolling_std(returns: &DateSeries, window: usize) -> DateSeries {
    if window == 0 || returns.len() < window {
        return DateSeries::default();
    }
    let stds = returns
        .values()
        .windows(window)
        .map(|w| w.std_dev())
        .collect::<Vec<_>>();
    let pairs = returns.dates()[window - 1..]
        .iter()
        .copied()
        .zip(stds)
        .collect();
    DateSeries::from_unsorted(pairs).drop_non_finite()
}

/// Latest volatility reading for a cumulative series.
///
/// Periodic returns come from the percent change of the cumulative series.
/// `raw` annualizes the latest rolling std with the timeframe's periods per
/// year; otherwise the latest rolling value is z-scored against the whole
/// rolling series. `None` when the history is too short to produce a value.
pub fn volatility(
    cumulative: &CumulativeReturnSeries,
    timeframe: Timeframe,
    window: usize,
    raw: bool,
) -> Option<f64> {
    let returns = cumulative.pct_change().drop_non_finite();
    let rolling = rolling_std(&returns, window);
    let (_, latest) = rolling.last()?;

    let value = if raw {
        latest * timeframe.periods_per_year().sqrt()
    } else {
        let mean = rolling.values().mean();
        let std = rolling.values().std_dev();
        (latest - mean) / std
    };
    value.is_finite().then_some(value)
}
