pub mod config;
pub mod error;
pub mod lead_lag;
pub mod momentum;
pub mod pipeline;
pub mod rank;
pub mod relative_strength;
pub mod resample;
pub mod returns;
pub mod series;
pub mod source;
pub mod store;
pub mod synthetic;
pub mod updater;
pub mod volatility;

use clap::{Args, ValueEnum};
use std::path::PathBuf;

use crate::lead_lag::GrangerTest;
use crate::momentum::MomentumMethod;
use crate::series::Timeframe;

/// Options shared by every subcommand that touches the store.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Directory holding the per-ticker CSV files
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Sector configuration JSON (built-in SPDR universe if omitted)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Tiingo API key (or set TIINGO_API_KEY env)
    #[arg(long, global = true)]
    pub api_key: Option<String>,

    /// Treat this date (YYYY-MM-DD) as today
    #[arg(long, global = true)]
    pub as_of: Option<String>,

    /// Delay (ms) after each vendor request
    #[arg(long, global = true)]
    pub request_delay_ms: Option<u64>,
}

/// Refresh every tracked ticker and regenerate weekly/monthly series.
#[derive(Args, Debug, Clone, Default)]
pub struct FetchArgs {
    /// Regenerate weekly/monthly files even when they are current
    #[arg(long)]
    pub force_resample: Option<bool>,

    /// Optional lock file path to prevent concurrent runs
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankKind {
    #[default]
    Rs,
    Momentum,
    Volatility,
}

/// Rank sectors by relative strength, RS momentum or volatility.
#[derive(Args, Debug, Clone, Default)]
pub struct RankArgs {
    #[arg(long, value_enum)]
    pub by: Option<RankKind>,

    /// daily, weekly or monthly
    #[arg(long)]
    pub timeframe: Option<Timeframe>,

    /// Periods of history behind each reading
    #[arg(long)]
    pub lookback: Option<usize>,

    /// Momentum window (periods), or rolling volatility window
    #[arg(long)]
    pub window: Option<usize>,

    /// slope or pct_change
    #[arg(long)]
    pub method: Option<MomentumMethod>,

    /// Rebase relative strength to 1.0 at the start of the lookback
    #[arg(long)]
    pub normalize: Option<bool>,
}

/// Rotation-graph trajectories (relative strength vs momentum) per sector.
#[derive(Args, Debug, Clone, Default)]
pub struct RrgArgs {
    #[arg(long)]
    pub timeframe: Option<Timeframe>,

    #[arg(long)]
    pub lookback: Option<usize>,

    /// Momentum window, also the trajectory tail length
    #[arg(long)]
    pub window: Option<usize>,

    #[arg(long)]
    pub normalize: Option<bool>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeadLagMethod {
    #[default]
    Xcorr,
    Granger,
}

/// Lead-lag matrix across sectors.
#[derive(Args, Debug, Clone, Default)]
pub struct LeadLagArgs {
    #[arg(long, value_enum)]
    pub method: Option<LeadLagMethod>,

    #[arg(long)]
    pub timeframe: Option<Timeframe>,

    #[arg(long)]
    pub max_lag: Option<usize>,

    /// ssr_ftest, ssr_chi2test or lrtest (Granger only)
    #[arg(long)]
    pub test: Option<GrangerTest>,

    /// Tickers to include (sectors if omitted)
    #[arg(long, num_args = 1..)]
    pub tickers: Option<Vec<String>>,
}

/// Last close and daily change for the benchmark and every sector.
#[derive(Args, Debug, Clone, Default)]
pub struct ChangesArgs {}

/// Largest holdings of a sector.
#[derive(Args, Debug, Clone, Default)]
pub struct HoldingsArgs {
    /// Sector ticker, e.g. XLK
    #[arg(long)]
    pub sector: String,

    #[arg(long)]
    pub top: Option<usize>,
}
