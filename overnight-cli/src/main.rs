//! Overnight CLI: backfill bars, train, forecast, validate, in one
//! resumable run.
//!
//! Exit codes:
//! - `0` DONE
//! - `4` DONE (UI DEGRADED)
//! - `1` FAILED mid-run
//! - `3` preflight failure, including another run holding the lock
//! - `130` / `143` / `129` terminated by SIGINT / SIGTERM / SIGHUP

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use overnight_core::data::{EodhdProvider, EodhdSettings};
use overnight_runner::error::EXIT_PREFLIGHT;
use overnight_runner::{
    new_run_id, ErrorCode, LimiterOverrides, Orchestrator, OvernightConfig, PhaseKind, RunError,
    RunOptions, RunPaths,
};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "overnight",
    version,
    about = "Overnight market-data run: bars backfill, training, forecast and validation"
)]
struct Cli {
    /// Reuse checkpoints from earlier runs (default). Accepts `--resume=false`.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", require_equals = true)]
    resume: Option<bool>,

    /// Ignore every checkpoint.
    #[arg(long, conflicts_with = "resume")]
    no_resume: bool,

    /// Disable all skip logic, including FRESH bars.
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Phases to run (default: all). E.g. `--phases=BARS,TRAIN_TICKER`.
    #[arg(long, value_delimiter = ',')]
    phases: Vec<PhaseKind>,

    /// Restrict bars and per-symbol training to these symbols.
    #[arg(long, value_delimiter = ',')]
    tickers: Option<Vec<String>>,

    /// Maximum concurrent provider requests.
    #[arg(long)]
    max_inflight: Option<usize>,

    /// Provider requests per second.
    #[arg(long)]
    rate: Option<f64>,

    /// Token bucket capacity (burst size).
    #[arg(long)]
    bucket_size: Option<f64>,

    /// Bars worker count.
    #[arg(long)]
    workers: Option<usize>,

    /// Config file. Defaults to `<repo-root>/overnight.toml` when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Repository root. Defaults to the current directory.
    #[arg(long)]
    repo_root: Option<PathBuf>,

    /// Market date to run as (YYYY-MM-DD). Defaults to today in market time.
    #[arg(long)]
    as_of: Option<NaiveDate>,
}

impl Cli {
    fn options(&self) -> RunOptions {
        let defaults = RunOptions::default();
        RunOptions {
            resume: if self.no_resume {
                false
            } else {
                self.resume.unwrap_or(defaults.resume)
            },
            force: self.force,
            phases: if self.phases.is_empty() {
                defaults.phases
            } else {
                self.phases.iter().copied().collect()
            },
            tickers: self.tickers.clone().filter(|t| !t.is_empty()),
            as_of: self.as_of,
        }
    }

    fn overrides(&self) -> LimiterOverrides {
        LimiterOverrides {
            max_inflight: self.max_inflight,
            rate_per_sec: self.rate,
            bucket_size: self.bucket_size,
            workers: self.workers,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("overnight: {e:#}");
            EXIT_PREFLIGHT
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let repo_root = match &cli.repo_root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("cannot determine the current directory")?,
    };

    let config = OvernightConfig::load_for_repo(&repo_root, cli.config.as_deref()).and_then(|mut c| {
        c.apply_overrides(&cli.overrides())?;
        Ok(c)
    });
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            let error = RunError::new(ErrorCode::ConfigInvalid, e.to_string());
            eprintln!("overnight: {error}");
            return Ok(error.exit_code());
        }
    };

    let run_id = new_run_id();
    let paths = RunPaths::resolve(&repo_root, &config.paths);
    init_tracing(&paths.log_file(&run_id));

    let api_key = std::env::var(&config.preflight.api_key_env).ok();
    let provider = EodhdProvider::new(api_key, EodhdSettings::default())
        .context("cannot build the provider client")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")?;

    let orchestrator = Orchestrator::new(config, cli.options(), &repo_root, Arc::new(provider))
        .with_run_id(run_id);
    let report = runtime.block_on(orchestrator.run());

    match (&report.verdict, &report.error) {
        (Some(verdict), _) => {
            eprintln!("overnight {}: {verdict}", report.run_id);
            if let Some(path) = &report.summary_path {
                eprintln!("summary: {}", path.display());
            }
        }
        (None, Some(error)) => eprintln!("overnight {}: {error}", report.run_id),
        (None, None) => eprintln!("overnight {}: interrupted", report.run_id),
    }
    Ok(report.exit_code)
}

/// Human output on stderr plus a plain copy in the per-run log file.
fn init_tracing(log_file: &Path) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let file = log_file
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(log_file));
    let file_layer = match file {
        Ok(f) => Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(f))),
        Err(e) => {
            eprintln!("overnight: run log {} unavailable: {e}", log_file.display());
            None
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
