use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor};
use std::{collections::BTreeMap, fmt, str::FromStr};
use tracing::{debug, warn};

use crate::error::{Result, RotationError};
use crate::series::{DateSeries, intersect};

/// Pearson correlation; `None` when either side has no variance.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    let corr = cov / (var_x.sqrt() * var_y.sqrt());
    (var_x > 0.0 && var_y > 0.0 && corr.is_finite()).then_some(corr)
}

/// Correlation of `a` shifted by `lag` positions against `b`. Positive lags
/// pair `a[t]` with `b[t + lag]` (a leads).
fn shifted_correlation(a: &[f64], b: &[f64], lag: i64) -> Option<f64> {
    let n = a.len();
    let shift = lag.unsigned_abs() as usize;
    if shift >= n {
        return None;
    }
    if lag >= 0 {
        pearson(&a[..n - shift], &b[shift..])
    } else {
        pearson(&a[shift..], &b[..n - shift])
    }
}

/// Lag in `[-max_lag, max_lag]` with the largest absolute correlation between
/// two return series, and the correlation there.
///
/// The series are inner-joined on date first, then shifted by position.
/// Positive lag means `a` leads `b`. Lags with undefined correlation are
/// skipped; ties keep the smallest lag.
pub fn cross_correlation_lead_lag(a: &DateSeries, b: &DateSeries, max_lag: usize) -> Result<(i64, f64)> {
    let (_, xs, ys) = intersect(a, b);
    if xs.len() < 2 {
        return Err(RotationError::insufficient("cross-correlation overlap", 2, xs.len()));
    }
    // shifts of n or more leave no overlap
    let max_lag = max_lag.min(xs.len() - 1) as i64;
    let mut best: Option<(i64, f64)> = None;
    for lag in -max_lag..=max_lag {
        let Some(corr) = shifted_correlation(&xs, &ys, lag) else {
            continue;
        };
        if best.is_none_or(|(_, c)| corr.abs() > c.abs()) {
            best = Some((lag, corr));
        }
    }
    best.ok_or_else(|| {
        RotationError::Alignment("no lag produced a defined correlation".into())
    })
}

/// Test statistic used to turn a Granger regression pair into a p-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrangerTest {
    /// F test on the sum of squared residuals.
    SsrFTest,
    /// Chi-squared test on the sum of squared residuals.
    #[default]
    SsrChi2Test,
    /// Likelihood ratio test.
    LrTest,
}

impl fmt::Display for GrangerTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GrangerTest::SsrFTest => "ssr_ftest",
            GrangerTest::SsrChi2Test => "ssr_chi2test",
            GrangerTest::LrTest => "lrtest",
        })
    }
}

impl FromStr for GrangerTest {
    type Err = RotationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ssr_ftest" | "f" => Ok(GrangerTest::SsrFTest),
            "ssr_chi2test" | "chi2" => Ok(GrangerTest::SsrChi2Test),
            "lrtest" | "lr" => Ok(GrangerTest::LrTest),
            other => Err(RotationError::Configuration(format!(
                "unknown Granger test '{other}' (expected ssr_ftest, ssr_chi2test or lrtest)"
            ))),
        }
    }
}

/// Solves `a * x = b` by Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(RotationError::InvalidSeries("singular regression design".into()));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}

/// Sum of squared residuals of an OLS fit of `y` on the rows of `x`.
pub fn ols_ssr(x: &[Vec<f64>], y: &[f64]) -> Result<f64> {
    let k = x.first().map(Vec::len).unwrap_or(0);
    if k == 0 || x.len() != y.len() || x.len() <= k {
        return Err(RotationError::insufficient("regression", k + 1, x.len()));
    }
    let mut xtx = vec![vec![0.0; k]; k];
    let mut xty = vec![0.0; k];
    for (row, yi) in x.iter().zip(y) {
        for i in 0..k {
            xty[i] += row[i] * yi;
            for j in 0..k {
                xtx[i][j] += row[i] * row[j];
            }
        }
    }
    let beta = solve(xtx, xty)?;
    Ok(x.iter()
        .zip(y)
        .map(|(row, yi)| {
            let fit: f64 = row.iter().zip(&beta).map(|(a, b)| a * b).sum();
            (yi - fit).powi(2)
        })
        .sum())
}

/// p-value that `x` does not Granger-cause `y` at exactly `lag`.
fn granger_p_value(y: &[f64], x: &[f64], lag: usize, test: GrangerTest) -> Result<f64> {
    let rows = lag..y.len();
    let nobs = rows.len();
    let restricted: Vec<Vec<f64>> = rows
        .clone()
        .map(|t| {
            std::iter::once(1.0)
                .chain((1..=lag).map(|l| y[t - l]))
                .collect()
        })
        .collect();
    let unrestricted: Vec<Vec<f64>> = rows
        .map(|t| {
            std::iter::once(1.0)
                .chain((1..=lag).map(|l| y[t - l]))
                .chain((1..=lag).map(|l| x[t - l]))
                .collect()
        })
        .collect();
    let target = &y[lag..];

    let ssr_r = ols_ssr(&restricted, target)?;
    let ssr_u = ols_ssr(&unrestricted, target)?;
    if ssr_u <= 0.0 {
        return Err(RotationError::InvalidSeries("unrestricted model fits exactly".into()));
    }

    let p = lag as f64;
    let n = nobs as f64;
    let dist_err = |e: statrs::StatsError| RotationError::InvalidSeries(e.to_string());
    let p_value = match test {
        GrangerTest::SsrFTest => {
            let df_resid = n - 2.0 * p - 1.0;
            let f = ((ssr_r - ssr_u) / p) / (ssr_u / df_resid);
            1.0 - FisherSnedecor::new(p, df_resid).map_err(dist_err)?.cdf(f)
        }
        GrangerTest::SsrChi2Test => {
            let chi2 = n * (ssr_r - ssr_u) / ssr_u;
            1.0 - ChiSquared::new(p).map_err(dist_err)?.cdf(chi2)
        }
        GrangerTest::LrTest => {
            let lr = n * (ssr_r / ssr_u).ln();
            1.0 - ChiSquared::new(p).map_err(dist_err)?.cdf(lr)
        }
    };
    Ok(p_value.clamp(0.0, 1.0))
}

/// Smallest p-value over lags `1..=max_lag` for "leader Granger-causes laggard",
/// and the lag achieving it. A p-value never below 1.0 reports lag 0.
pub fn granger_lead_lag(
    leader: &DateSeries,
    laggard: &DateSeries,
    max_lag: usize,
    test: GrangerTest,
) -> Result<(f64, usize)> {
    if max_lag == 0 {
        return Err(RotationError::Configuration("max lag must be positive".into()));
    }
    let (_, y, x) = intersect(laggard, leader);
    let required = max_lag
        .checked_mul(3)
        .and_then(|n| n.checked_add(2))
        .ok_or_else(|| RotationError::Configuration(format!("max lag {max_lag} out of range")))?;
    if y.len() < required {
        return Err(RotationError::insufficient("Granger test overlap", required, y.len()));
    }

    let mut min_p = 1.0;
    let mut best_lag = 0;
    for lag in 1..=max_lag {
        let p = granger_p_value(&y, &x, lag, test)?;
        if p < min_p {
            min_p = p;
            best_lag = lag;
        }
    }
    Ok((min_p, best_lag))
}

/// Square table indexed by (leader, laggard), in ticker order.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadLagMatrix<T> {
    tickers: Vec<String>,
    cells: Vec<Vec<T>>,
}

impl<T> LeadLagMatrix<T> {
    fn build(tickers: &[String], mut cell: impl FnMut(&str, &str) -> T) -> Self {
        let cells = tickers
            .iter()
            .map(|leader| tickers.iter().map(|laggard| cell(leader, laggard)).collect())
            .collect();
        Self {
            tickers: tickers.to_vec(),
            cells,
        }
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    pub fn get(&self, leader: &str, laggard: &str) -> Option<&T> {
        let i = self.tickers.iter().position(|t| t == leader)?;
        let j = self.tickers.iter().position(|t| t == laggard)?;
        self.cells.get(i)?.get(j)
    }

    /// Rows in ticker order: `(leader, cells by laggard)`.
    pub fn rows(&self) -> impl Iterator<Item = (&str, &[T])> {
        self.tickers
            .iter()
            .map(String::as_str)
            .zip(self.cells.iter().map(Vec::as_slice))
    }
}

/// Best cross-correlation lag per (leader, laggard); positive means the row leads.
/// Pairs with a missing or unusable series are `None`; the diagonal is `Some(0)`.
pub fn cross_correlation_matrix(
    returns: &BTreeMap<String, DateSeries>,
    tickers: &[String],
    max_lag: usize,
) -> LeadLagMatrix<Option<i64>> {
    LeadLagMatrix::build(tickers, |leader, laggard| {
        if leader == laggard {
            return Some(0);
        }
        let (a, b) = (returns.get(leader)?, returns.get(laggard)?);
        match cross_correlation_lead_lag(a, b, max_lag) {
            Ok((lag, corr)) => {
                debug!("{} -> {}: lag {} corr {:.4}", leader, laggard, lag, corr);
                Some(lag)
            }
            Err(e) => {
                warn!("cross-correlation {} -> {} failed: {}", leader, laggard, e);
                None
            }
        }
    })
}

/// One Granger matrix cell. `p_value` is `None` on the diagonal and for
/// failed pairs, whose lag is then 0.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GrangerCell {
    pub p_value: Option<f64>,
    pub lag: usize,
}

pub fn granger_matrix(
    returns: &BTreeMap<String, DateSeries>,
    tickers: &[String],
    max_lag: usize,
    test: GrangerTest,
) -> LeadLagMatrix<GrangerCell> {
    LeadLagMatrix::build(tickers, |leader, laggard| {
        if leader == laggard {
            return GrangerCell::default();
        }
        let (Some(a), Some(b)) = (returns.get(leader), returns.get(laggard)) else {
            return GrangerCell::default();
        };
        match granger_lead_lag(a, b, max_lag, test) {
            Ok((p, lag)) => GrangerCell {
                p_value: Some(p),
                lag,
            },
            Err(e) => {
                warn!("Granger {} -> {} failed: {}", leader, laggard, e);
                GrangerCell::default()
            }
        }
    })
}
