use crate::error::{Result, RotationError};
use crate::series::{CumulativeReturnSeries, DateSeries};

/// Cumulative growth of one unit, anchored at 1.0 on the first period.
///
/// With `lookback = Some(k)` only the trailing `k + 1` periods are used; the
/// oldest of them is the anchor whose value is exactly 1.0.
pub fn cumulative_returns(
    returns: &DateSeries,
    lookback: Option<usize>,
) -> Result<CumulativeReturnSeries> {
    if returns.is_empty() {
        return Err(RotationError::insufficient("cumulative returns", 1, 0));
    }
    let window = match lookback {
        Some(k) if k >= returns.len() => {
            return Err(RotationError::insufficient(
                "cumulative returns lookback",
                k + 1,
                returns.len(),
            ));
        }
        Some(k) => returns.tail(k + 1),
        None => returns.clone(),
    };

    let mut acc = 1.0;
    let mut first = true;
    Ok(window.map(|r| {
        if first {
            first = false;
        } else {
            acc *= 1.0 + r;
        }
        acc
    }))
}
