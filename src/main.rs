use anyhow::{Context, Result};
use clap::Parser;
use cli::Args;
use itertools::Itertools;
use services::gtfs_archive::GtfsArchive;
use services::reconciler::{Reconciliation, reconcile};
use services::stop_fetcher::TranslocClient;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

mod cli;
mod model;
mod services;
mod utils;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _guard = init_tracing(&args)?;

    let outcome = run(&args).await?;

    match outcome {
        Outcome::DryRun(reconciliation) => {
            for (gtfs_id, transloc_id) in reconciliation.mapping.iter().sorted() {
                println!("{gtfs_id} -> {transloc_id}");
            }
            println!(
                "would write out {} new stops into {}",
                reconciliation.mapping.len(),
                args.destination().display()
            );
        }
        Outcome::Written { remapped_stops } => {
            println!(
                "wrote out {} new stops into {}",
                remapped_stops,
                args.destination().display()
            );
        }
    }

    Ok(())
}

/// Logs to stderr and, with `--log-dir`, to a daily rolling file.
/// The returned guard flushes the file log when dropped.
fn init_tracing(args: &Args) -> Result<Option<WorkerGuard>> {
    let default_level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let stderr_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_log, guard) = match &args.log_dir {
        Some(log_dir) => {
            let appender = tracing_appender::rolling::daily(log_dir, "gtfs_stop_rectifier.log");
            let (non_blocking_appender, guard) = tracing_appender::non_blocking(appender);

            // A layer that logs events to rolling files.
            let file_log = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking_appender)
                .with_ansi(false)
                .pretty();

            (Some(file_log), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(stderr_log)
        .with(file_log)
        .with(env_filter)
        .try_init()
        .context("failed to set up logging")?;

    Ok(guard)
}

#[derive(Debug)]
enum Outcome {
    DryRun(Reconciliation),
    Written { remapped_stops: usize },
}

/// Reads the GTFS stops, fetches the TransLoc stops, matches them and writes the rectified zip.
/// Nothing is written if any step fails.
async fn run(args: &Args) -> Result<Outcome> {
    let mut archive = GtfsArchive::open(&args.gtfs_file)
        .with_context(|| format!("error opening {}", args.gtfs_file.display()))?;
    let gtfs_stops = archive.stops().context("error reading the GTFS stops")?;

    let client = TranslocClient::new(&args.endpoint, &args.api_key, args.timeout())?;
    let transloc_stops = client
        .fetch_stops(&args.agency_id)
        .await
        .with_context(|| format!("error fetching the TransLoc stops of agency {}", args.agency_id))?;

    let reconciliation = reconcile(&gtfs_stops, &transloc_stops, args.reconcile_settings())?;

    if !reconciliation.diagnostics.is_empty() {
        info!(
            "{} stops need a closer look, see the warnings above",
            reconciliation.diagnostics.len()
        );
    }

    if args.dry_run {
        return Ok(Outcome::DryRun(reconciliation));
    }

    let destination = args.destination();
    info!(
        "writing {} remapped stops from {} into {}",
        reconciliation.mapping.len(),
        archive.path().display(),
        destination.display()
    );

    let summary = archive
        .write_remapped(&reconciliation.mapping, &args.rewrite_options(), &destination)
        .with_context(|| format!("error writing {}", destination.display()))?;

    if summary.rewritten_references > 0 {
        info!("rewrote {} stop references", summary.rewritten_references);
    }

    Ok(Outcome::Written {
        remapped_stops: summary.remapped_stops,
    })
}
