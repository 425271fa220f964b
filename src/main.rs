use anyhow::{Context, Result};
use bytebite::config::AppConfig;
use bytebite::device::adb::has_authorised_device;
use bytebite::device::process::ProcessRunner;
use bytebite::device::Adb;
use bytebite::driver::{spawn_workflow, Driver, RunOutcome, Workflow};
use bytebite::runlog::{RunRecord, RunSink, RunStatus};
use bytebite::storage::export::render_markdown;
use bytebite::storage::{AggregationStore, MarkdownExporter};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "bytebite",
    about = "Android device test orchestrator: forensic extraction, controlled simulation, stock/rooted comparison",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides BYTEBITE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Device serial (overrides config)
    #[arg(long, global = true)]
    serial: Option<String>,

    /// Logs directory (overrides config)
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached devices
    Devices,

    /// Run forensic extraction
    Forensic {
        /// Package to hash and pull (overrides config)
        #[arg(long)]
        package: Option<String>,

        /// Hash and snapshot through su
        #[arg(long)]
        root: bool,
    },

    /// Verify the on-device marker against logcat
    Traceability,

    /// Run the controlled offensive simulation
    Offensive,

    /// Run stock and rooted phases and compare them
    Compare {
        /// Never execute the rooted phase
        #[arg(long)]
        no_root_phase: bool,
    },

    /// Recreate the results database from every run.json
    Rebuild,

    /// Show cumulative results
    Summary {
        /// Show the most recent run instead
        #[arg(long)]
        latest: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Number of slowest steps to list
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut cfg = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(),
    };
    if let Some(serial) = &cli.serial {
        cfg.device.serial = serial.clone();
    }
    if let Some(dir) = &cli.logs_dir {
        cfg.paths.logs_dir = dir.to_string_lossy().into_owned();
    }
    Ok(cfg)
}

fn open_store(cfg: &AppConfig) -> Result<AggregationStore> {
    Ok(AggregationStore::open(&cfg.results_db())?
        .with_exporter(Box::new(MarkdownExporter::new(cfg.results_md()))))
}

/// Cancel `token` on Ctrl-C; the run stops before its next step.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current step");
            token.cancel();
        }
    });
}

fn exit_for(status: RunStatus) -> ExitCode {
    if status == RunStatus::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn report_run(out: &RunOutcome) -> ExitCode {
    println!("Run status = {}", out.record.status);
    println!("Run saved: {}", out.run_json.display());
    if let Some(err) = &out.record.error {
        println!("Error: {}", err);
    }
    exit_for(out.record.status)
}

fn print_record(path: &Path, record: &RunRecord) {
    println!("Latest run: {}", path.display());
    println!("{:<12} {}", "Run id:", record.meta_str("run_id"));
    println!("{:<12} {}", "Mode:", record.meta_str("mode"));
    println!("{:<12} {}", "Profile:", record.meta_str("profile"));
    println!("{:<12} {}", "Status:", record.status.friendly());
    println!("{:<12} {:.3}s", "Elapsed:", record.elapsed_s);
    if let Some(err) = &record.error {
        println!("{:<12} {}", "Error:", err);
    }
    println!("\n{:<40} | {:<4} | {:>9}", "Step", "OK", "ms");
    println!("{:-<40}-|-{:-<4}-|-{:->9}", "", "", "");
    for step in &record.steps {
        println!(
            "{:<40} | {:<4} | {:>9}",
            step.name,
            if step.ok { "yes" } else { "NO" },
            step.duration_ms
        );
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Commands::InitConfig { force } = &cli.command {
        let path = cli.config.clone().unwrap_or_else(AppConfig::resolve_path);
        if path.exists() && !force {
            println!("Config already exists: {} (use --force to overwrite)", path.display());
            return Ok(ExitCode::SUCCESS);
        }
        AppConfig::default().save(&path)?;
        println!("Config written: {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let mut cfg = load_config(&cli)?;
    let logs_dir = cfg.logs_dir();
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("failed to create logs dir: {}", logs_dir.display()))?;

    match cli.command {
        Commands::InitConfig { .. } => Ok(ExitCode::SUCCESS),

        Commands::Rebuild => {
            let store = open_store(&cfg)?;
            let report = store.rebuild(&logs_dir)?;
            println!(
                "Rebuilt results from {} run(s), {} skipped",
                report.imported, report.skipped
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Summary { latest, json, top } => {
            let store = open_store(&cfg)?;
            if latest {
                let Some(path) = store.latest_run()? else {
                    println!("No runs recorded yet");
                    return Ok(ExitCode::SUCCESS);
                };
                let record = RunRecord::load(&path)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                } else {
                    print_record(&path, &record);
                }
                return Ok(ExitCode::SUCCESS);
            }
            let mut summary = store.summary()?;
            summary.bottlenecks = store.bottlenecks(top)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", render_markdown(&summary, &store.easy_read()?));
            }
            Ok(ExitCode::SUCCESS)
        }

        command => {
            if let Commands::Forensic { package, root } = &command {
                if let Some(pkg) = package {
                    cfg.forensic.target_package = pkg.clone();
                }
                cfg.forensic.root_mode |= *root;
            }
            if let Commands::Compare { no_root_phase: true } = &command {
                cfg.comparison.run_root_phase = false;
            }

            let adb = Adb::new(
                Arc::new(ProcessRunner),
                &cfg.device.serial,
                &cfg.device.adb_bin,
            );
            let store = open_store(&cfg);
            let mut driver = Driver::new(adb, cfg).with_logs_dir(&logs_dir);
            match store {
                Ok(store) => {
                    let sink: Arc<dyn RunSink> = Arc::new(store);
                    driver = driver.with_sink(sink);
                }
                Err(e) => warn!(error = %e, "Results store unavailable; runs are recorded to JSON only"),
            }

            run_device_command(command, driver).await
        }
    }
}

async fn run_device_command(command: Commands, driver: Driver) -> Result<ExitCode> {
    match command {
        Commands::Devices => {
            let listed = driver.adb().devices().await;
            println!("{}", listed.stdout);
            if !listed.ok() {
                eprintln!("{}", listed.failure_text());
                return Ok(ExitCode::FAILURE);
            }
            if !has_authorised_device(&listed.stdout) {
                eprintln!("No authorised device attached");
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Forensic { .. } | Commands::Traceability => {
            let workflow = if matches!(command, Commands::Traceability) {
                Workflow::Traceability
            } else {
                Workflow::Forensic
            };
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let out = driver.run(workflow, &cancel).await?;
            Ok(report_run(&out))
        }

        Commands::Offensive => {
            let handle = spawn_workflow(Arc::new(driver), Workflow::Offensive).await?;
            info!("Simulation running; press Ctrl-C to cancel");
            cancel_on_ctrl_c(handle.cancel_token());
            let out = handle.join().await?;
            Ok(report_run(&out))
        }

        Commands::Compare { .. } => {
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let out = driver.compare(&cancel).await?;
            let r = &out.result;
            println!("Comparison saved: {}", out.path.display());
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "run_id": r.run_id,
                    "root_available": r.root_available,
                    "stock": r.stock.status,
                    "rooted": r.rooted.status,
                }))?
            );
            Ok(exit_for(r.stock.status))
        }

        Commands::InitConfig { .. } | Commands::Rebuild | Commands::Summary { .. } => {
            Ok(ExitCode::SUCCESS)
        }
    }
}
