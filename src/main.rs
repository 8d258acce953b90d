use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use quant_engine::commands::{backtest, frontier};
use quant_engine::config::EngineRuntimeSettings;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

const SETTING_KEYS: [&str; 5] = [
    "RISK_FREE_RATE",
    "LOOKBACK_CALENDAR_DAYS",
    "MIN_LOOKBACK_ROWS",
    "SOLVER_TIMEOUT_MS",
    "SOLVER_MAX_ITERATIONS",
];

#[derive(Parser)]
#[command(name = "quant-engine")]
#[command(about = "Backtest combined strategies and compute portfolio weightings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backtest for a JSON strategy configuration
    Backtest {
        /// Strategy configuration (JSON)
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
        /// Price panel: JSON array of price bars
        #[arg(long, value_name = "PATH")]
        data: PathBuf,
        /// Where to write the result; stdout when omitted
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Compute the efficient frontier and reference weightings for a price panel
    Frontier {
        /// Price panel: JSON array of price bars
        #[arg(long, value_name = "PATH")]
        data: PathBuf,
        /// Number of frontier portfolios
        #[arg(long, default_value_t = 20)]
        points: usize,
        /// Transaction cost used for the rebalancing-interval study
        #[arg(long, default_value_t = 0.001)]
        cost: f64,
        /// Where to write the report; stdout when omitted
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn settings_from_env() -> HashMap<String, String> {
    SETTING_KEYS
        .iter()
        .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = EngineRuntimeSettings::from_settings_map(&settings_from_env())?;
    info!(
        "Runtime settings: risk-free {:.4}, lookback {} days, min {} rows, solver timeout {:?}",
        settings.risk_free_rate,
        settings.lookback_calendar_days,
        settings.min_lookback_rows,
        settings.solver_timeout
    );

    match cli.command {
        Commands::Backtest {
            config,
            data,
            output,
        } => backtest::run(settings, &config, &data, output.as_deref())?,
        Commands::Frontier {
            data,
            points,
            cost,
            output,
        } => frontier::run(settings, &data, points, cost, output.as_deref())?,
    }

    Ok(())
}
