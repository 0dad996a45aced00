use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path, path::PathBuf};

use crate::error::{Result, RotationError};

/// Weighted constituent basket standing in for an instrument before it existed
/// in its current form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticBasket {
    /// Constituent ticker -> weight (renormalized over constituents with data).
    pub weights: BTreeMap<String, f64>,
    /// Last date covered by the synthetic segment.
    pub cutover: NaiveDate,
    /// First date of the real instrument's own history.
    pub resumption: NaiveDate,
}

/// Sector universe: benchmark, sectors, display names, holdings and synthetic baskets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorConfig {
    pub benchmark: String,
    pub sector_etfs: Vec<String>,
    #[serde(default)]
    pub sector_names: BTreeMap<String, String>,
    /// Largest holdings per sector, in descending weight order.
    #[serde(default)]
    pub holdings: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub synthetic: BTreeMap<String, SyntheticBasket>,
}

impl SectorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            RotationError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let cfg: SectorConfig = serde_json::from_str(&text).map_err(|e| {
            RotationError::Configuration(format!("malformed {}: {e}", path.display()))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.benchmark.trim().is_empty() {
            return Err(RotationError::Configuration("benchmark is empty".into()));
        }
        if self.sector_etfs.is_empty() {
            return Err(RotationError::Configuration("sector_etfs is empty".into()));
        }
        for (ticker, basket) in &self.synthetic {
            if basket.weights.is_empty() {
                return Err(RotationError::Configuration(format!(
                    "synthetic basket for {ticker} has no constituents"
                )));
            }
            if let Some((c, w)) = basket.weights.iter().find(|(_, w)| !(**w > 0.0)) {
                return Err(RotationError::Configuration(format!(
                    "synthetic basket for {ticker}: weight of {c} must be positive, got {w}"
                )));
            }
            if basket.cutover >= basket.resumption {
                return Err(RotationError::Configuration(format!(
                    "synthetic basket for {ticker}: cutover {} must precede resumption {}",
                    basket.cutover, basket.resumption
                )));
            }
        }
        Ok(())
    }

    /// Benchmark first, then sectors (without repeating the benchmark).
    pub fn all_tickers(&self) -> Vec<String> {
        let mut out = vec![self.benchmark.clone()];
        out.extend(
            self.sector_etfs
                .iter()
                .filter(|t| **t != self.benchmark)
                .cloned(),
        );
        out
    }

    pub fn is_synthetic(&self, ticker: &str) -> bool {
        self.synthetic.contains_key(ticker)
    }

    pub fn basket(&self, ticker: &str) -> Option<&SyntheticBasket> {
        self.synthetic.get(ticker)
    }

    pub fn sector_name<'a>(&'a self, ticker: &'a str) -> &'a str {
        self.sector_names
            .get(ticker)
            .map(String::as_str)
            .unwrap_or(ticker)
    }

    pub fn top_holdings(&self, sector: &str, n: usize) -> Vec<String> {
        self.holdings
            .get(sector)
            .map(|h| h.iter().take(n).cloned().collect())
            .unwrap_or_default()
    }
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(t, w)| (t.to_string(), *w)).collect()
}

fn names(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(t, n)| (t.to_string(), n.to_string()))
        .collect()
}

fn holdings(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    pairs
        .iter()
        .map(|(t, h)| (t.to_string(), h.iter().map(|s| s.to_string()).collect()))
        .collect()
}

impl Default for SectorConfig {
    /// SPDR select-sector universe benchmarked against SPY.
    fn default() -> Self {
        let sector_etfs = [
            "XLE", "XLB", "XLI", "XLU", "XLV", "XLF", "XLY", "XLP", "XLK", "XLC", "XLRE",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        // XLC was reconstituted in June 2018, XLRE carved out of XLF in October 2015.
        let mut synthetic = BTreeMap::new();
        synthetic.insert(
            "XLC".to_string(),
            SyntheticBasket {
                weights: weights(&[
                    ("META", 0.2096),
                    ("GOOG", 0.1173),
                    ("GOOGL", 0.1163),
                    ("NFLX", 0.0505),
                    ("T", 0.0491),
                    ("CHTR", 0.0478),
                    ("CMCSA", 0.0467),
                    ("DIS", 0.0453),
                    ("VZ", 0.0448),
                    ("EA", 0.0381),
                    ("PARA", 0.0170),
                    ("LUMN", 0.0161),
                ]),
                cutover: ymd(2018, 6, 18),
                resumption: ymd(2018, 6, 19),
            },
        );
        synthetic.insert(
            "XLRE".to_string(),
            SyntheticBasket {
                weights: weights(&[
                    ("SPG", 0.12),
                    ("AMT", 0.0798),
                    ("PSA", 0.075),
                    ("CCI", 0.059),
                    ("EQR", 0.0555),
                    ("AVB", 0.0464),
                    ("WY", 0.0432),
                    ("EQIX", 0.0426),
                    ("PLD", 0.0412),
                    ("WELL", 0.0404),
                ]),
                cutover: ymd(2015, 10, 7),
                resumption: ymd(2015, 10, 8),
            },
        );

        Self {
            benchmark: "SPY".to_string(),
            sector_etfs,
            sector_names: names(&[
                ("SPY", "S&P 500"),
                ("XLE", "Energy"),
                ("XLB", "Materials"),
                ("XLI", "Industrials"),
                ("XLU", "Utilities"),
                ("XLV", "Health Care"),
                ("XLF", "Financials"),
                ("XLY", "Consumer Discretionary"),
                ("XLP", "Consumer Staples"),
                ("XLK", "Technology"),
                ("XLC", "Communication Services"),
                ("XLRE", "Real Estate"),
            ]),
            holdings: holdings(&[
                ("XLE", &["XOM", "CVX", "COP", "EOG", "SLB"]),
                ("XLB", &["LIN", "SHW", "APD", "ECL", "FCX"]),
                ("XLI", &["GE", "RTX", "CAT", "UBER", "HON"]),
                ("XLU", &["NEE", "SO", "DUK", "CEG", "AEP"]),
                ("XLV", &["LLY", "UNH", "JNJ", "ABBV", "MRK"]),
                ("XLF", &["BRK.B", "JPM", "V", "MA", "BAC"]),
                ("XLY", &["AMZN", "TSLA", "HD", "MCD", "BKNG"]),
                ("XLP", &["COST", "PG", "WMT", "KO", "PM"]),
                ("XLK", &["AAPL", "MSFT", "NVDA", "AVGO", "ORCL"]),
                ("XLC", &["META", "GOOGL", "GOOG", "NFLX", "TMUS"]),
                ("XLRE", &["PLD", "AMT", "WELL", "EQIX", "SPG"]),
            ]),
            synthetic,
        }
    }
}

/// Runtime knobs for the fetch chain and the store.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// First date requested on a full history fetch.
    pub history_start: NaiveDate,
    /// Days of staleness absorbed before an update fetch is triggered (weekends, holidays).
    pub freshness_tolerance_days: i64,
    /// Fixed pause after each vendor request.
    pub request_delay_ms: u64,
    pub request_timeout_secs: u64,
    /// Retries after the first failed attempt of a request.
    pub max_retries: usize,
    /// Longest date range asked for in one request.
    pub max_days_per_request: i64,
    /// Overrides the local clock as "today".
    pub as_of: Option<NaiveDate>,
}

impl Settings {
    pub fn today(&self) -> NaiveDate {
        self.as_of
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            history_start: ymd(2005, 7, 6),
            freshness_tolerance_days: 1,
            request_delay_ms: 3000,
            request_timeout_secs: 30,
            max_retries: 3,
            max_days_per_request: 3650,
            as_of: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = SectorConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.all_tickers()[0], "SPY");
        assert_eq!(cfg.all_tickers().len(), 12);
        assert!(cfg.is_synthetic("XLC"));
        assert!(!cfg.is_synthetic("XLK"));
    }

    #[test]
    fn test_validate_rejects_inverted_regime_dates() {
        let mut cfg = SectorConfig::default();
        if let Some(b) = cfg.synthetic.get_mut("XLC") {
            b.resumption = b.cutover;
        }
        assert!(matches!(cfg.validate(), Err(RotationError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_zero_weight() {
        let mut cfg = SectorConfig::default();
        if let Some(b) = cfg.synthetic.get_mut("XLRE") {
            b.weights.insert("O".into(), 0.0);
        }
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_top_holdings() {
        let cfg = SectorConfig::default();
        assert_eq!(cfg.top_holdings("XLK", 2), vec!["AAPL", "MSFT"]);
        assert!(cfg.top_holdings("NOPE", 3).is_empty());
    }

    #[test]
    fn test_load_round_trip_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sectors.json");
        let cfg = SectorConfig::default();
        fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();
        let loaded = SectorConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_load_malformed_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ \"benchmark\": 1 }").unwrap();
        assert!(matches!(
            SectorConfig::load(&path),
            Err(RotationError::Configuration(_))
        ));
    }
}
