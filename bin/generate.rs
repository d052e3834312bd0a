use anyhow::Context;
use catalog_delta::{
    generate_to_path, EventThresholds, GenerateConfig, MemoryTracker, SqliteStore,
    DEFAULT_SAMPLE_INTERVAL,
};
use clap::{Arg, ArgAction, Command};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info};

fn cli() -> Command {
    Command::new("generate")
        .about("Generate a product catalog and its delta file")
        .arg(
            Arg::new("size")
                .long("size")
                .help("Number of products in the catalog")
                .value_parser(clap::value_parser!(u64).range(1..))
                .required(true),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .help("Delta file to write (.gz / .zst are compressed)")
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
            Arg::new("p-delete")
                .long("p-delete")
                .help("Percent of products deleted")
                .value_parser(clap::value_parser!(u8))
                .default_value("10"),
        )
        .arg(
            Arg::new("p-update")
                .long("p-update")
                .help("Percent of products updated")
                .value_parser(clap::value_parser!(u8))
                .default_value("10"),
        )
        .arg(
            Arg::new("p-add")
                .long("p-add")
                .help("Percent of products that spawn a new product")
                .value_parser(clap::value_parser!(u8))
                .default_value("20"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help("Seed for a reproducible catalog")
                .value_parser(clap::value_parser!(u64)),
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
            // usage errors are configuration failures, reported before any I/O
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
    let size = *matches.get_one::<u64>("size").context("missing 'size' parameter")?;
    let output = matches
        .get_one::<PathBuf>("output")
        .context("missing 'output' parameter")?;
    let db = matches.get_one::<PathBuf>("db").context("missing 'db' parameter")?;
    let thresholds = EventThresholds::new(
        *matches.get_one::<u8>("p-delete").context("missing 'p-delete'")?,
        *matches.get_one::<u8>("p-update").context("missing 'p-update'")?,
        *matches.get_one::<u8>("p-add").context("missing 'p-add'")?,
    )?;
    let mut rng = match matches.get_one::<u64>("seed") {
        Some(seed) => StdRng::seed_from_u64(*seed),
        None => StdRng::from_entropy(),
    };

    let store = SqliteStore::open(db)
        .with_context(|| format!("failed to open database {}", db.display()))?;
    let config = GenerateConfig {
        catalog_size: size,
        thresholds,
    };

    let memory = MemoryTracker::start(DEFAULT_SAMPLE_INTERVAL);
    let start = Instant::now();
    let report = generate_to_path(&store, output, &config, &mut rng).await?;
    let elapsed = start.elapsed().as_secs_f64();
    let memory = memory.finish().await;

    report.log();
    memory.log("Generate dataset");
    info!(
        rows = report.delta_rows,
        elapsed = %format!("{elapsed:.1}s"),
        rows_per_sec = %format!("{:.0}", report.delta_rows as f64 / elapsed),
        "Generate dataset done"
    );
    Ok(())
}
