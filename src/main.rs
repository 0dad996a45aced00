use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color};
use sector_rotation::{
    ChangesArgs, CommonArgs, FetchArgs, HoldingsArgs, LeadLagArgs, LeadLagMethod, RankArgs,
    RankKind, RrgArgs,
    config::{SectorConfig, Settings},
    lead_lag::LeadLagMatrix,
    pipeline::{BatchResult, Pipeline, status_summary},
    rank::{format_ranking, table_with_header},
    series::Timeframe,
    source::TiingoSource,
    store::acquire_lock,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Sector ETF rotation: relative strength, momentum, volatility and lead-lag")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Fetch(FetchArgs),
    Rank(RankArgs),
    Rrg(RrgArgs),
    LeadLag(LeadLagArgs),
    Changes(ChangesArgs),
    Holdings(HoldingsArgs),
}

fn load_config(common: &CommonArgs) -> Result<SectorConfig> {
    match &common.config {
        Some(path) => SectorConfig::load(path).with_context(|| format!("load {}", path.display())),
        None => Ok(SectorConfig::default()),
    }
}

fn settings(common: &CommonArgs) -> Result<Settings> {
    let mut s = Settings::with_data_dir(
        common
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./data")),
    );
    if let Some(ms) = common.request_delay_ms {
        s.request_delay_ms = ms;
    }
    if let Some(d) = &common.as_of {
        s.as_of = Some(NaiveDate::parse_from_str(d, "%Y-%m-%d").context("parse --as-of")?);
    }
    Ok(s)
}

fn build_pipeline(common: &CommonArgs) -> Result<Pipeline> {
    let config = load_config(common)?;
    let settings = settings(common)?;
    let api_key = common
        .api_key
        .clone()
        .or_else(|| std::env::var("TIINGO_API_KEY").ok())
        .context("missing Tiingo API key (set TIINGO_API_KEY or pass --api-key)")?;
    let source = TiingoSource::new(&api_key, &settings)?;
    Ok(Pipeline::new(config, settings, Box::new(source))?)
}

fn print_status<T>(batch: &BatchResult<T>, loaded: usize) {
    println!("\n{}", status_summary(&batch.errors, loaded));
}

fn print_matrix<T>(matrix: &LeadLagMatrix<T>, cell: impl Fn(&T) -> String) {
    let header = std::iter::once("").chain(matrix.tickers().iter().map(String::as_str));
    let mut table = table_with_header(header, 1);
    for (leader, cells) in matrix.rows() {
        let mut row = vec![Cell::new(leader).fg(Color::Cyan)];
        row.extend(cells.iter().map(|c| Cell::new(cell(c))));
        table.add_row(row);
    }
    println!("{table}");
}

fn signed_cell(text: String, value: f64) -> Cell {
    let color = if value >= 0.0 { Color::Green } else { Color::Red };
    Cell::new(text).fg(color)
}

async fn fetch(pipeline: &Pipeline, args: FetchArgs) -> Result<()> {
    let _lock = match &args.lock_file {
        Some(path) => Some(acquire_lock(path).context("another refresh holds the lock")?),
        None => None,
    };
    let batch = pipeline
        .refresh_all(args.force_resample.unwrap_or(false))
        .await;
    for (ticker, outcome) in &batch.value {
        println!("{:<6} {:?}", ticker, outcome);
    }
    print_status(&batch, batch.value.len());
    Ok(())
}

async fn rank(pipeline: &Pipeline, args: RankArgs) -> Result<()> {
    let cfg = pipeline.config();
    let tickers = cfg.sector_etfs.clone();
    let tf = args.timeframe.unwrap_or(Timeframe::Daily);
    let lookback = args.lookback.unwrap_or(30);
    let normalize = args.normalize.unwrap_or(true);

    match args.by.unwrap_or_default() {
        RankKind::Rs => {
            let batch = pipeline
                .rank_relative_strength(&tickers, &cfg.benchmark, tf, lookback, normalize)
                .await;
            print!(
                "{}",
                format_ranking(
                    &format!("Sector Relative Strength Rankings ({lookback} {} back)", tf.unit()),
                    &batch.value
                )
            );
            print_status(&batch, batch.value.len());
        }
        RankKind::Momentum => {
            let window = args.window.unwrap_or(5);
            let batch = pipeline
                .rank_momentum(
                    &tickers,
                    &cfg.benchmark,
                    tf,
                    lookback,
                    window,
                    normalize,
                    args.method.unwrap_or_default(),
                )
                .await;
            print!(
                "{}",
                format_ranking(
                    &format!(
                        "Sector RS Momentum Rankings ({lookback} {unit} back, {window} {unit} window)",
                        unit = tf.unit()
                    ),
                    &batch.value
                )
            );
            print_status(&batch, batch.value.len());
        }
        RankKind::Volatility => {
            let batch = pipeline
                .rank_volatility(&tickers, args.window.unwrap_or(20))
                .await;
            for r in &batch.value {
                println!("\n{} Timeframe Rankings:", r.timeframe);
                print!("{}", format_ranking("Most Volatile Sectors:", &r.most_volatile));
                print!("{}", format_ranking("Most Stable Sectors:", &r.most_stable));
                println!("{}", "-".repeat(50));
            }
            print_status(&batch, tickers.len());
        }
    }
    Ok(())
}

async fn rrg(pipeline: &Pipeline, args: RrgArgs) -> Result<()> {
    let cfg = pipeline.config();
    let tf = args.timeframe.unwrap_or(Timeframe::Daily);
    let lookback = args.lookback.unwrap_or(30);
    let window = args.window.unwrap_or(5);
    let batch = pipeline
        .rotation_trajectories(
            &cfg.sector_etfs,
            &cfg.benchmark,
            tf,
            lookback,
            window,
            args.normalize.unwrap_or(true),
        )
        .await;
    println!(
        "Relative Rotation Graph vs {} ({lookback} {unit} lookback, {window} {unit} tail)",
        cfg.benchmark,
        unit = tf.unit()
    );
    for t in &batch.value {
        println!("\n{} ({})", t.ticker, cfg.sector_name(&t.ticker));
        for p in &t.points {
            println!("  {}  rs {:>8.4}  mom {:>+10.6}", p.date, p.rs, p.momentum);
        }
    }
    print_status(&batch, batch.value.len());
    Ok(())
}

async fn lead_lag(pipeline: &Pipeline, args: LeadLagArgs) -> Result<()> {
    let tickers = args
        .tickers
        .unwrap_or_else(|| pipeline.config().sector_etfs.clone());
    let tf = args.timeframe.unwrap_or(Timeframe::Daily);
    let max_lag = args.max_lag.unwrap_or(10);
    if max_lag == 0 {
        bail!("--max-lag must be positive");
    }

    match args.method.unwrap_or_default() {
        LeadLagMethod::Xcorr => {
            let batch = pipeline.sector_lead_lag_matrix(&tickers, tf, max_lag).await;
            println!("Lead-lag (best lag, row leads column when positive), {tf}, max lag {max_lag}");
            print_matrix(&batch.value, |c| {
                c.map(|l| l.to_string()).unwrap_or_else(|| "-".into())
            });
            print_status(&batch, tickers.len() - batch.errors.len().min(tickers.len()));
        }
        LeadLagMethod::Granger => {
            let test = args.test.unwrap_or_default();
            let batch = pipeline
                .granger_lead_lag_matrix(&tickers, tf, max_lag, test)
                .await;
            println!("Granger lead-lag (min p-value @ lag, {test}), {tf}, max lag {max_lag}");
            print_matrix(&batch.value, |c| match c.p_value {
                Some(p) => format!("{p:.4}@{}", c.lag),
                None => "-".into(),
            });
            print_status(&batch, tickers.len() - batch.errors.len().min(tickers.len()));
        }
    }
    Ok(())
}

async fn changes(pipeline: &Pipeline, _args: ChangesArgs) -> Result<()> {
    let batch = pipeline.daily_changes().await;
    let mut table = table_with_header(["Ticker", "Name", "Last", "Prev", "Chg $", "Chg %", "Volume"], 2);
    for r in &batch.value {
        table.add_row(vec![
            Cell::new(&r.ticker).fg(Color::Cyan),
            Cell::new(&r.name),
            Cell::new(format!("{:.2}", r.last_close)),
            Cell::new(format!("{:.2}", r.prev_close)),
            signed_cell(format!("{:+.2}", r.change), r.change),
            signed_cell(format!("{:+.2}%", r.change_pct * 100.0), r.change_pct),
            Cell::new(r.volume.map(|v| format!("{v:.0}")).unwrap_or_else(|| "-".into())),
        ]);
    }
    println!("{table}");
    print_status(&batch, batch.value.len());
    Ok(())
}

fn holdings(common: &CommonArgs, args: HoldingsArgs) -> Result<()> {
    let config = load_config(common)?;
    let top = config.top_holdings(&args.sector, args.top.unwrap_or(5));
    if top.is_empty() {
        bail!("no holdings configured for {}", args.sector);
    }
    println!("{} ({})", args.sector, config.sector_name(&args.sector));
    for (i, t) in top.iter().enumerate() {
        println!("{:>2}. {}", i + 1, t);
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Rank(RankArgs::default()));
    if let Command::Holdings(args) = command {
        return holdings(&cli.common, args);
    }

    let pipeline = build_pipeline(&cli.common)?;
    info!("data dir {}", pipeline.settings().data_dir.display());
    match command {
        Command::Fetch(args) => fetch(&pipeline, args).await?,
        Command::Rank(args) => rank(&pipeline, args).await?,
        Command::Rrg(args) => rrg(&pipeline, args).await?,
        Command::LeadLag(args) => lead_lag(&pipeline, args).await?,
        Command::Changes(args) => changes(&pipeline, args).await?,
        Command::Holdings(_) => {}
    }
    Ok(())
}
