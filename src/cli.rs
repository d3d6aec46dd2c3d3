use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::services::{
    gtfs_archive::RewriteOptions,
    reconciler::{DEFAULT_AMBIGUITY_FACTOR, DEFAULT_TOLERANCE_METERS, ReconcileSettings},
    stop_fetcher::{DEFAULT_STOPS_ENDPOINT, DEFAULT_TIMEOUT},
};

/// TransLoc's API does not have stops that match up with the stops in agency GTFS files.
/// This re-assigns GTFS stop_ids to the TransLoc ones of the nearest stops.
#[derive(Parser)]
#[command(version, about)]
pub struct Args {
    /// GTFS zip to rewrite. Overwritten in place unless --output is given
    pub gtfs_file: PathBuf,

    /// TransLoc agency id
    pub agency_id: String,

    /// TransLoc (Mashape) API key
    pub api_key: String,

    /// Meters within which the nearest GTFS stop counts as a match
    #[arg(long, default_value_t = DEFAULT_TOLERANCE_METERS)]
    pub tolerance: f64,

    /// Other stops closer than the best distance times this are reported as possible matches
    #[arg(long, default_value_t = DEFAULT_AMBIGUITY_FACTOR)]
    pub ambiguity_factor: f64,

    /// TransLoc stops endpoint
    #[arg(long, default_value = DEFAULT_STOPS_ENDPOINT)]
    pub endpoint: String,

    /// Seconds to wait for the TransLoc API
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub timeout: u64,

    /// Write the rectified GTFS zip here instead of overwriting GTFS_FILE
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Print the stop mapping without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Also rewrite parent_station, stop_times.txt, transfers.txt and pathways.txt
    #[arg(long)]
    pub rewrite_references: bool,

    /// Also log to a daily rolling file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Log debug output
    #[arg(long, short)]
    pub verbose: bool,
}

impl Args {
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            tolerance_meters: self.tolerance,
            ambiguity_factor: self.ambiguity_factor,
        }
    }

    pub fn rewrite_options(&self) -> RewriteOptions {
        RewriteOptions {
            rewrite_references: self.rewrite_references,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn destination(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| self.gtfs_file.clone())
    }
}
