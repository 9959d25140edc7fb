//! Sleepwatch CLI - Command-line interface for Sleepwatch
//!
//! Commands:
//! - run: Fetch, score and report every device on the account
//! - devices: List devices discovered on the account
//! - cache: Inspect or clean the per-day sample cache
//! - config: Print the effective configuration with secrets redacted

use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sleepwatch::cache::CacheStore;
use sleepwatch::clock::{Clock, SystemClock};
use sleepwatch::config::DetectorConfig;
use sleepwatch::types::{AnomalySource, DeviceOutcome, Metric, RunReport};
use sleepwatch::{DetectorError, ErrorKind, Orchestrator, Vendor, VERSION};

/// Sleepwatch - Flag unusual nights from your sleep tracker
#[derive(Parser)]
#[command(name = "sleepwatch")]
#[command(version = VERSION)]
#[command(about = "Per-device sleep anomaly detection", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults to environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Sleep tracker vendor (emfit, oura, eight)
    #[arg(long, global = true)]
    vendor: Option<Vendor>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, score and report every device
    Run {
        /// Training window in days
        #[arg(long)]
        train_days: Option<u32>,

        /// Expected fraction of anomalous nights
        #[arg(long)]
        contamination: Option<f64>,

        /// Device to process (repeatable; default is every device on the account)
        #[arg(long = "device-id")]
        device_ids: Vec<String>,

        /// Bypass the sample cache
        #[arg(long)]
        no_cache: bool,

        /// Empty the sample cache before fetching
        #[arg(long)]
        clear_cache: bool,

        /// Mark this date (YYYY-MM-DD) anomalous regardless of its score
        #[arg(long)]
        force_outlier: Option<NaiveDate>,

        /// Send a push notification when the latest night is anomalous
        #[arg(long)]
        alert: bool,

        /// Ask the language model to explain an anomalous latest night
        #[arg(long)]
        explain: bool,

        /// Recent anomalies listed per device
        #[arg(long, default_value = "5")]
        show_n: usize,

        /// Output format
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// List devices on the account
    Devices {
        /// Output format
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Inspect or clean the sample cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print the effective configuration with secrets redacted
    Config,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove every cached entry
    Clear,
    /// Show cache location and size
    Stats,
    /// Remove entries that can no longer be served
    Prune,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable summary
    Text,
    /// Pretty-printed JSON
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr so stdout stays clean for JSON output
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<(), SleepwatchCliError> {
    let config = load_config(cli.config.as_deref(), cli.vendor)?;

    match cli.command {
        Commands::Run {
            train_days,
            contamination,
            device_ids,
            no_cache,
            clear_cache,
            force_outlier,
            alert,
            explain,
            show_n,
            format,
        } => {
            let overrides = RunOverrides {
                train_days,
                contamination,
                device_ids,
                no_cache,
                force_outlier,
                alert,
                explain,
            };
            cmd_run(overrides.apply(config)?, clear_cache, show_n, format)
        }

        Commands::Devices { format } => cmd_devices(config, format),

        Commands::Cache { action } => cmd_cache(&config, action),

        Commands::Config => cmd_config(&config),
    }
}

/// JSON file when given, otherwise the process environment
fn load_config(path: Option<&Path>, vendor: Option<Vendor>) -> Result<DetectorConfig, SleepwatchCliError> {
    let mut config = match path {
        Some(path) => DetectorConfig::from_json_file(path)?,
        // Vendor-scoped variables follow the vendor chosen on the command line
        None => DetectorConfig::from_env_lookup(|key| match (key, vendor) {
            ("SLEEP_TRACKER", Some(vendor)) => Some(vendor.as_str().to_string()),
            _ => std::env::var(key).ok(),
        })?,
    };
    if let Some(vendor) = vendor {
        config.vendor = vendor;
    }
    Ok(config)
}

struct RunOverrides {
    train_days: Option<u32>,
    contamination: Option<f64>,
    device_ids: Vec<String>,
    no_cache: bool,
    force_outlier: Option<NaiveDate>,
    alert: bool,
    explain: bool,
}

impl RunOverrides {
    fn apply(self, mut config: DetectorConfig) -> Result<DetectorConfig, SleepwatchCliError> {
        if let Some(days) = self.train_days {
            config.training_window_days = days;
        }
        if let Some(contamination) = self.contamination {
            config.model.contamination = contamination;
        }
        if !self.device_ids.is_empty() {
            config.device_ids = self.device_ids;
        }
        if self.no_cache {
            config.cache.enabled = false;
        }
        if self.force_outlier.is_some() {
            config.force_outlier_date = self.force_outlier;
        }
        config.alert.enabled |= self.alert;

        // Explanations are opt-in per run
        config.explainer = if self.explain {
            Some(config.explainer.take().unwrap_or_default())
        } else {
            None
        };

        config.validate()?;
        Ok(config)
    }
}

fn cmd_run(
    config: DetectorConfig,
    clear_cache: bool,
    show_n: usize,
    format: OutputFormat,
) -> Result<(), SleepwatchCliError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = Orchestrator::from_config(config, clock)?;

    if clear_cache {
        match orchestrator.cache() {
            Some(cache) => {
                let removed = cache.clear()?;
                info!(removed, "cleared sample cache");
            }
            None => warn!("--clear-cache ignored, the cache is disabled"),
        }
    }

    let report = orchestrator.run()?;

    match format {
        OutputFormat::Json => println!("{}", report.to_json()?),
        OutputFormat::Text => print!("{}", render_report(&report, show_n)),
    }

    match report.failures() {
        0 => Ok(()),
        failed => Err(SleepwatchCliError::DeviceFailures(failed)),
    }
}

fn cmd_devices(mut config: DetectorConfig, format: OutputFormat) -> Result<(), SleepwatchCliError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    config.cache.enabled = false;
    let orchestrator = Orchestrator::from_config(config, clock)?;

    let session = orchestrator.authenticate()?;
    let devices = orchestrator.plugin().list_devices(&session)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&devices)?),
        OutputFormat::Text => {
            if devices.is_empty() {
                println!("No {} devices found on the account", orchestrator.plugin().vendor());
            }
            for device in &devices {
                println!("{}\t{}", device.id, device.display_name);
            }
        }
    }
    Ok(())
}

fn cmd_cache(config: &DetectorConfig, action: CacheAction) -> Result<(), SleepwatchCliError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = CacheStore::from_config(&config.cache, clock)?;

    match action {
        CacheAction::Clear => {
            let removed = cache.clear()?;
            println!("Removed {} cached entries from {}", removed, config.cache.dir.display());
        }
        CacheAction::Stats => {
            let stats = cache.stats();
            println!("Cache directory: {}", config.cache.dir.display());
            println!("Enabled: {}", config.cache.enabled);
            println!("TTL for today's entries: {} h", config.cache.ttl_hours);
            println!("Entries: {}", stats.entries);
        }
        CacheAction::Prune => {
            let removed = cache.prune_expired()?;
            println!("Pruned {} expired entries", removed);
        }
    }
    Ok(())
}

fn cmd_config(config: &DetectorConfig) -> Result<(), SleepwatchCliError> {
    println!("{}", serde_json::to_string_pretty(&config.redacted())?);
    Ok(())
}

// Text report

fn render_report(report: &RunReport, show_n: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Sleepwatch {} report ({} devices, {} failed)",
        report.vendor,
        report.devices.len(),
        report.failures()
    );

    for entry in &report.devices {
        let device = &entry.device;
        let _ = writeln!(out, "\n{} [{}]", device.display_name, device.id);

        let result = match &entry.outcome {
            DeviceOutcome::Success(result) => result,
            DeviceOutcome::Failure(failure) => {
                let _ = writeln!(out, "  FAILED at {}: {}", failure.stage, failure.message);
                continue;
            }
        };

        let _ = writeln!(
            out,
            "  Window {} .. {}: {} nights, {} flagged",
            result.window_start, result.window_end, result.rows, result.flagged_count
        );

        let latest = &result.latest;
        let verdict = match (latest.is_anomaly, latest.source) {
            (true, AnomalySource::Forced) => "ANOMALY (forced)",
            (true, AnomalySource::Model) => "ANOMALY",
            (false, _) => "normal",
        };
        let stale = if result.latest_is_today { "" } else { ", today missing" };
        let _ = writeln!(
            out,
            "  Latest {}{}: {} (score {:.4})",
            latest.date, stale, verdict, latest.score
        );

        for metric in Metric::ALL {
            if let Some(summary) = result.summary.get(&metric) {
                let _ = writeln!(
                    out,
                    "    {:<32} {:>8.1}  (mean {:.1} ± {:.1})",
                    metric.label(),
                    latest.feature_values.get(metric),
                    summary.mean,
                    summary.std
                );
            }
        }

        let recent: Vec<_> = result
            .history
            .iter()
            .rev()
            .filter(|r| r.is_anomaly)
            .take(show_n)
            .collect();
        if !recent.is_empty() {
            let _ = writeln!(out, "  Recent anomalies:");
            for anomaly in recent {
                let row = &anomaly.feature_values;
                let _ = writeln!(
                    out,
                    "    {}  score {:>8.4}  HR {:.1}  RR {:.1}  sleep {:.0} min  score {:.0}",
                    anomaly.date,
                    anomaly.score,
                    row.heart_rate,
                    row.respiratory_rate,
                    row.sleep_duration_minutes,
                    row.sleep_score
                );
            }
        }

        if let Some(explanation) = &result.explanation {
            let _ = writeln!(out, "  Analysis: {}", explanation);
        }
        if result.notified {
            let _ = writeln!(out, "  Notification sent");
        }
    }

    if let Some(cache) = &report.cache {
        let _ = writeln!(
            out,
            "\nCache: {} hits, {} misses, {} entries",
            cache.hits, cache.misses, cache.entries
        );
    }
    out
}

// Error types

#[derive(Debug)]
enum SleepwatchCliError {
    Io(io::Error),
    Detector(DetectorError),
    Json(serde_json::Error),
    DeviceFailures(usize),
}

impl From<io::Error> for SleepwatchCliError {
    fn from(e: io::Error) -> Self {
        SleepwatchCliError::Io(e)
    }
}

impl From<DetectorError> for SleepwatchCliError {
    fn from(e: DetectorError) -> Self {
        SleepwatchCliError::Detector(e)
    }
}

impl From<serde_json::Error> for SleepwatchCliError {
    fn from(e: serde_json::Error) -> Self {
        SleepwatchCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<SleepwatchCliError> for CliError {
    fn from(e: SleepwatchCliError) -> Self {
        match e {
            SleepwatchCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            SleepwatchCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            SleepwatchCliError::DeviceFailures(count) => CliError {
                code: "DEVICE_FAILURES".to_string(),
                message: format!("{} device runs failed", count),
                hint: Some("Run with --log-level debug for details".to_string()),
            },
            SleepwatchCliError::Detector(e) => {
                let hint = match &e {
                    DetectorError::Authentication(_) => {
                        Some("Check the vendor credentials in your config or environment")
                    }
                    DetectorError::NoDevicesFound(_) => Some("Pass --device-id or check the account"),
                    DetectorError::Configuration(_) => Some("Run 'sleepwatch config' to review settings"),
                    DetectorError::CacheIo(_) | DetectorError::CacheCorrupt { .. } => {
                        Some("Retry with --no-cache or run 'sleepwatch cache clear'")
                    }
                    _ => None,
                };
                CliError {
                    code: error_code(e.kind()).to_string(),
                    message: e.to_string(),
                    hint: hint.map(str::to_string),
                }
            }
        }
    }
}

fn error_code(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Configuration => "CONFIGURATION_ERROR",
        ErrorKind::Fetch => "FETCH_ERROR",
        ErrorKind::Data => "DATA_ERROR",
        ErrorKind::Model => "MODEL_ERROR",
        ErrorKind::Cache => "CACHE_ERROR",
        ErrorKind::Collaborator => "COLLABORATOR_ERROR",
    }
}
