use anyhow::Context;
use catalog_delta::{
    reconcile_path, DeletePolicy, MemoryTracker, ReconcileConfig, SqliteStore,
    DEFAULT_SAMPLE_INTERVAL,
};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info};

fn cli() -> Command {
    Command::new("reconcile")
        .about("Apply a delta file to the catalog database in batches")
        .arg(
            Arg::new("input")
                .long("input")
                .help("Delta file to read (.gz / .zst are decompressed)")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("updated-catalog.csv"),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .help("SQLite catalog database")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("test-product-catalog.db"),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .help("Operations per bulk write")
                .value_parser(clap::value_parser!(u64).range(1..))
                .default_value("100000"),
        )
        .arg(
            Arg::new("delete-policy")
                .long("delete-policy")
                .help("How deleted products are detected")
                .value_parser(["tombstone", "full-scan"])
                .default_value("tombstone"),
        )
        .arg(
            Arg::new("max-retries")
                .long("max-retries")
                .help("Retries for a failed bulk write")
                .value_parser(clap::value_parser!(u32))
                .default_value("0"),
        )
        .arg(
            Arg::new("retry-backoff-ms")
                .long("retry-backoff-ms")
                .help("Pause between retries")
                .value_parser(clap::value_parser!(u64))
                .default_value("500"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = match cli().try_get_matches() {
        Ok(matches) => matches,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            eprintln!("{e}");
            println!("FAIL");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = catalog_delta::init_logging(matches.get_flag("verbose")) {
        eprintln!("{e:#}");
    }

    match run(&matches).await {
        Ok(()) => {
            println!("SUCCESS");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("FAIL");
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let input = matches
        .get_one::<PathBuf>("input")
        .context("missing 'input' parameter")?;
    let db = matches.get_one::<PathBuf>("db").context("missing 'db' parameter")?;
    let batch_size = *matches
        .get_one::<u64>("batch-size")
        .context("missing 'batch-size' parameter")?;
    let delete_policy: DeletePolicy = matches
        .get_one::<String>("delete-policy")
        .context("missing 'delete-policy' parameter")?
        .parse()?;

    let config = ReconcileConfig {
        batch_size: usize::try_from(batch_size).context("batch size too large")?,
        delete_policy,
        max_retries: *matches.get_one::<u32>("max-retries").unwrap_or(&0),
        retry_backoff: Duration::from_millis(
            *matches.get_one::<u64>("retry-backoff-ms").unwrap_or(&500),
        ),
    };
    let store = SqliteStore::open(db)
        .with_context(|| format!("failed to open database {}", db.display()))?;

    let memory = MemoryTracker::start(DEFAULT_SAMPLE_INTERVAL);
    let start = Instant::now();
    let report = reconcile_path(input, &store, &config)
        .await
        .with_context(|| format!("failed to reconcile {}", input.display()))?;
    let elapsed = start.elapsed().as_secs_f64();
    let memory = memory.finish().await;

    report.log();
    memory.log("Update dataset");
    info!(
        batches = report.batches_flushed,
        swept = report.swept,
        elapsed = %format!("{elapsed:.1}s"),
        rows_per_sec = %format!("{:.0}", report.rows_processed as f64 / elapsed),
        "Update dataset done"
    );
    Ok(())
}
