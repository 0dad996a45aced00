use crate::error::{Result, RotationError};
use crate::series::{CumulativeReturnSeries, DateSeries, RelativeStrengthSeries, align_forward_fill};

/// Target cumulative return divided by benchmark cumulative return.
///
/// Both inputs are aligned on the union of their dates with forward fill
/// before `lookback` trims to the trailing `lookback + 1` rows, so the fill
/// sees the whole history. With `normalize` the line is rebased to start at 1.0.
pub fn relative_strength(
    target: &CumulativeReturnSeries,
    benchmark: &CumulativeReturnSeries,
    lookback: Option<usize>,
    normalize: bool,
) -> Result<RelativeStrengthSeries> {
    let aligned = align_forward_fill(target, benchmark);
    if aligned.is_empty() {
        return Err(RotationError::Alignment(
            "target and benchmark share no dates".into(),
        ));
    }
    if let Some((d, _, b)) = aligned.iter().find(|(_, _, b)| *b <= 0.0) {
        return Err(RotationError::Alignment(format!(
            "benchmark cumulative value {b} on {d} is not positive"
        )));
    }

    let start = match lookback {
        Some(k) => aligned.len().saturating_sub(k + 1),
        None => 0,
    };
    let rows = &aligned[start..];
    let (dates, mut ratios): (Vec<_>, Vec<_>) = rows.iter().map(|(d, t, b)| (*d, t / b)).unzip();

    if normalize {
        let base = ratios[0];
        if base == 0.0 || !base.is_finite() {
            return Err(RotationError::Alignment(format!(
                "cannot normalize relative strength starting at {base}"
            )));
        }
        ratios.iter_mut().for_each(|r| *r /= base);
    }

    DateSeries::new(dates, ratios)
}
