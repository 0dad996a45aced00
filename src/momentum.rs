use chrono::NaiveDate;
use serde::Serialize;
use std::{fmt, str::FromStr};

use crate::error::{Result, RotationError};
use crate::series::{DateSeries, RelativeStrengthSeries};

/// How relative-strength momentum is measured over the trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MomentumMethod {
    /// OLS slope of the values against `0..window`.
    #[default]
    Slope,
    /// `last / first - 1` over the window.
    PctChange,
}

impl fmt::Display for MomentumMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MomentumMethod::Slope => f.write_str("slope"),
            MomentumMethod::PctChange => f.write_str("pct_change"),
        }
    }
}

impl FromStr for MomentumMethod {
    type Err = RotationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "slope" => Ok(MomentumMethod::Slope),
            "pct_change" | "pct-change" | "pct" => Ok(MomentumMethod::PctChange),
            other => Err(RotationError::Configuration(format!(
                "unknown momentum method '{other}' (expected slope or pct_change)"
            ))),
        }
    }
}

/// Least-squares slope of `y` against its index. Zero for a single point.
pub fn ols_slope(y: &[f64]) -> f64 {
    let n = y.len() as f64;
    if y.len() < 2 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = y.iter().sum::<f64>() / n;
    let (num, den) = y
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, v)| {
            let dx = i as f64 - mean_x;
            (num + dx * (v - mean_y), den + dx * dx)
        });
    num / den
}

fn check_window(rs: &RelativeStrengthSeries, window: usize) -> Result<()> {
    if window == 0 {
        return Err(RotationError::Configuration(
            "momentum window must be positive".into(),
        ));
    }
    if rs.len() < window {
        return Err(RotationError::insufficient(
            "relative strength momentum",
            window,
            rs.len(),
        ));
    }
    Ok(())
}

/// Momentum of the trailing `window` points of a relative-strength line.
pub fn momentum(rs: &RelativeStrengthSeries, window: usize, method: MomentumMethod) -> Result<f64> {
    check_window(rs, window)?;
    let tail = &rs.values()[rs.len() - window..];
    match method {
        MomentumMethod::Slope => Ok(ols_slope(tail)),
        MomentumMethod::PctChange => {
            let first = tail[0];
            if first == 0.0 {
                return Err(RotationError::InvalidSeries(
                    "relative strength is zero at the start of the window".into(),
                ));
            }
            Ok(tail[tail.len() - 1] / first - 1.0)
        }
    }
}

/// Slope over every trailing window, oldest first, dated by each window's last date.
/// The result has `len - window + 1` points.
pub fn momentum_series(
    rs: &RelativeStrengthSeries,
    window: usize,
    method: MomentumMethod,
) -> Result<DateSeries> {
    if method != MomentumMethod::Slope {
        return Err(RotationError::Unsupported(format!(
            "rolling momentum is only available for slope, not {method}"
        )));
    }
    check_window(rs, window)?;
    let slopes = rs.values().windows(window).map(ols_slope).collect();
    let dates = rs.dates()[window - 1..].to_vec();
    DateSeries::new(dates, slopes)
}

/// One point of a rotation-graph trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RotationPoint {
    pub date: NaiveDate,
    pub rs: f64,
    pub momentum: f64,
}

/// Last `window` (relative strength, rolling slope) pairs, oldest first.
///
/// Needs at least `window + 1` relative-strength points so the tail has a full
/// set of slopes behind it.
pub fn rotation_trajectory(rs: &RelativeStrengthSeries, window: usize) -> Result<Vec<RotationPoint>> {
    if rs.len() < window + 1 {
        return Err(RotationError::insufficient(
            "rotation trajectory",
            window + 1,
            rs.len(),
        ));
    }
    let slopes = momentum_series(rs, window, MomentumMethod::Slope)?;
    let points = slopes
        .iter()
        .filter_map(|(date, momentum)| {
            rs.get(date).map(|rs| RotationPoint { date, rs, momentum })
        })
        .collect::<Vec<_>>();
    let skip = points.len().saturating_sub(window);
    Ok(points.into_iter().skip(skip).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn series(values: &[f64]) -> DateSeries {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        DateSeries::from_unsorted(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| (start + Duration::days(i as i64), *v))
                .collect(),
        )
    }

    #[test]
    fn test_slope_sign_follows_direction() {
        let up = series(&[1.0, 1.01, 1.03, 1.04, 1.08]);
        let down = series(&[1.0, 0.99, 0.97, 0.96, 0.92]);
        let flat = series(&[1.2; 5]);
        assert!(momentum(&up, 5, MomentumMethod::Slope).unwrap() > 0.0);
        assert!(momentum(&down, 5, MomentumMethod::Slope).unwrap() < 0.0);
        assert!(momentum(&flat, 5, MomentumMethod::Slope).unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_slope_of_line_is_exact() {
        let rs = series(&[5.0, 1.0, 1.5, 2.0, 2.5]);
        let m = momentum(&rs, 4, MomentumMethod::Slope).unwrap();
        assert!((m - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_pct_change_over_window() {
        let rs = series(&[9.0, 1.0, 1.1, 1.25]);
        let m = momentum(&rs, 3, MomentumMethod::PctChange).unwrap();
        assert!((m - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_short_series_is_insufficient() {
        let res = momentum(&series(&[1.0, 1.1]), 5, MomentumMethod::Slope);
        assert!(matches!(res, Err(RotationError::InsufficientData { .. })));
    }

    #[test]
    fn test_rolling_series_length_and_dates() {
        let rs = series(&[1.0, 1.1, 1.2, 1.1, 1.0, 1.05]);
        let rolled = momentum_series(&rs, 3, MomentumMethod::Slope).unwrap();
        assert_eq!(rolled.len(), 4);
        assert_eq!(rolled.dates()[0], rs.dates()[2]);
        assert!((rolled.values()[0] - 0.1).abs() < 1e-12);
        assert!((rolled.values()[2] + 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_rolling_pct_change_is_unsupported() {
        let res = momentum_series(&series(&[1.0, 1.1, 1.2]), 2, MomentumMethod::PctChange);
        assert!(matches!(res, Err(RotationError::Unsupported(_))));
    }

    #[test]
    fn test_rotation_trajectory_tail() {
        let rs = series(&[1.0, 1.02, 1.03, 1.05, 1.04, 1.06, 1.08]);
        let points = rotation_trajectory(&rs, 3).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[2].date, rs.dates()[6]);
        assert_eq!(points[2].rs, 1.08);
        assert!(rotation_trajectory(&series(&[1.0, 1.1, 1.2]), 3).is_err());
    }
}
