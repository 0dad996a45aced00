use thiserror::Error;

use crate::series::Timeframe;

/// Failures surfaced by the store, the fetch chain and the analytics engines.
#[derive(Debug, Error)]
pub enum RotationError {
    /// Vendor request failed (network, non-success status, malformed payload).
    #[error("fetch failed for {ticker}: {reason}")]
    Fetch { ticker: String, reason: String },

    /// Zero rows after every fetch/resample attempt.
    #[error("no {timeframe} data available for {ticker}")]
    DataUnavailable { ticker: String, timeframe: Timeframe },

    /// Series exists but is shorter than the requested window.
    #[error("insufficient data for {context}: need {required} points, have {available}")]
    InsufficientData {
        context: String,
        required: usize,
        available: usize,
    },

    /// No usable overlap, or a non-positive benchmark value.
    #[error("alignment failed: {0}")]
    Alignment(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another run holds the store lock.
    #[error("store locked by another run ({path}): {source}")]
    Locked {
        path: String,
        source: std::io::Error,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Dates out of order, duplicated, or mismatched column lengths.
    #[error("invalid series: {0}")]
    InvalidSeries(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RotationError {
    pub fn insufficient(context: impl Into<String>, required: usize, available: usize) -> Self {
        RotationError::InsufficientData {
            context: context.into(),
            required,
            available,
        }
    }

    pub fn fetch(ticker: &str, reason: impl std::fmt::Display) -> Self {
        RotationError::Fetch {
            ticker: ticker.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<tempfile::PersistError> for RotationError {
    fn from(e: tempfile::PersistError) -> Self {
        RotationError::Io(e.error)
    }
}

pub type Result<T> = std::result::Result<T, RotationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_data_formatting() {
        let err = RotationError::insufficient("XLK vs SPY momentum", 5, 3);
        let msg = err.to_string();
        assert!(msg.contains("XLK vs SPY momentum"));
        assert!(msg.contains("need 5"));
        assert!(msg.contains("have 3"));
    }

    #[test]
    fn test_data_unavailable_names_timeframe() {
        let err = RotationError::DataUnavailable {
            ticker: "XLRE".to_string(),
            timeframe: Timeframe::Weekly,
        };
        assert_eq!(err.to_string(), "no weekly data available for XLRE");
    }

    #[test]
    fn test_fetch_error_formatting() {
        let err = RotationError::fetch("XLE", "HTTP 500");
        assert_eq!(err.to_string(), "fetch failed for XLE: HTTP 500");
    }
}
