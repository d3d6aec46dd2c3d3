//! Matches live stops to the nearest static GTFS stop and builds the id mapping
use std::collections::HashMap;
use std::fmt;

use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::model::stop_model::{Coordinates, LiveStop, StopRecord};
use crate::utils::haversine_meters;

/// If the nearest stop is further than this it is not a match.
pub const DEFAULT_TOLERANCE_METERS: f64 = 30.0;

/// Multiplier on the best distance used to flag other candidates,
/// e.g. with 1.5 stops at 3 and 4.5 meters get flagged.
pub const DEFAULT_AMBIGUITY_FACTOR: f64 = 10.0;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ReconcileSettings {
    pub tolerance_meters: f64,
    pub ambiguity_factor: f64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        ReconcileSettings {
            tolerance_meters: DEFAULT_TOLERANCE_METERS,
            ambiguity_factor: DEFAULT_AMBIGUITY_FACTOR,
        }
    }
}

/// One static stop considered for a live stop.
#[derive(Clone, Debug)]
pub struct CandidateMatch<'a> {
    pub stop: &'a StopRecord,
    /// meters
    pub distance: f64,
}

/// Non-fatal findings produced while matching.
#[derive(Clone, Debug, PartialEq)]
pub enum Diagnostic {
    /// No static stop within the tolerance. `nearest` is the closest one regardless of tolerance.
    NoMatchFound {
        live_stop_id: String,
        live_stop_name: String,
        nearest: Option<(String, f64)>,
    },
    /// More than one static stop is closer than `best distance * ambiguity factor`.
    /// `candidates` counts every kept candidate under the threshold, the best one included.
    AmbiguousMatch {
        live_stop_id: String,
        best_stop_id: String,
        candidates: usize,
        threshold_meters: f64,
    },
    /// A later live stop claimed a static stop that was already mapped. The later one wins.
    MappingOverwritten {
        static_stop_id: String,
        previous_live_stop_id: String,
        live_stop_id: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::NoMatchFound {
                live_stop_id,
                live_stop_name,
                nearest: Some((stop_id, distance)),
            } => write!(
                f,
                "no matching GTFS stop found for {live_stop_name} ({live_stop_id}), nearest is {stop_id} at {distance:.1} meters"
            ),
            Diagnostic::NoMatchFound {
                live_stop_id,
                live_stop_name,
                nearest: None,
            } => write!(
                f,
                "no matching GTFS stop found for {live_stop_name} ({live_stop_id})"
            ),
            Diagnostic::AmbiguousMatch {
                live_stop_id,
                best_stop_id,
                candidates,
                threshold_meters,
            } => write!(
                f,
                "{candidates} stops within {threshold_meters:.1} meters possibly match {live_stop_id}, picked {best_stop_id}"
            ),
            Diagnostic::MappingOverwritten {
                static_stop_id,
                previous_live_stop_id,
                live_stop_id,
            } => write!(
                f,
                "GTFS stop {static_stop_id} was matched to {previous_live_stop_id} and is now matched to {live_stop_id}"
            ),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Reconciliation {
    /// GTFS stop_id -> live stop id
    pub mapping: HashMap<String, String>,
    /// In the order they were found
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ReconcileError {
    #[error("{source_name} stop {stop_id} has malformed coordinates {location}")]
    MalformedRecord {
        source_name: &'static str,
        stop_id: String,
        location: Coordinates,
    },

    #[error("invalid {name} {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

/// Maps every GTFS stop that is the nearest stop of some live stop to that live stop's id.
///
/// Live stops are processed in the given order. When two live stops pick the same GTFS stop
/// the later one wins and a [`Diagnostic::MappingOverwritten`] is recorded.
/// Fails before matching anything if any coordinate is not a valid latitude/longitude.
#[tracing::instrument(err, skip_all, fields(static_stops = static_stops.len(), live_stops = live_stops.len()))]
pub fn reconcile(
    static_stops: &[StopRecord],
    live_stops: &[LiveStop],
    settings: ReconcileSettings,
) -> Result<Reconciliation, ReconcileError> {
    validate(static_stops, live_stops, settings)?;

    let mut reconciliation = Reconciliation::default();

    for live_stop in live_stops {
        match_live_stop(live_stop, static_stops, settings, &mut reconciliation);
    }

    info!(
        "matched {} of {} live stops",
        reconciliation.mapping.len(),
        live_stops.len()
    );

    Ok(reconciliation)
}

fn validate(
    static_stops: &[StopRecord],
    live_stops: &[LiveStop],
    settings: ReconcileSettings,
) -> Result<(), ReconcileError> {
    if !settings.tolerance_meters.is_finite() || settings.tolerance_meters <= 0.0 {
        return Err(ReconcileError::InvalidParameter {
            name: "tolerance",
            value: settings.tolerance_meters,
        });
    }

    if !settings.ambiguity_factor.is_finite() || settings.ambiguity_factor < 0.0 {
        return Err(ReconcileError::InvalidParameter {
            name: "ambiguity factor",
            value: settings.ambiguity_factor,
        });
    }

    if let Some(stop) = static_stops.iter().find(|s| !s.location.is_valid()) {
        return Err(ReconcileError::MalformedRecord {
            source_name: "GTFS",
            stop_id: stop.id.clone(),
            location: stop.location,
        });
    }

    if let Some(stop) = live_stops.iter().find(|s| !s.location.is_valid()) {
        return Err(ReconcileError::MalformedRecord {
            source_name: "live",
            stop_id: stop.id.clone(),
            location: stop.location,
        });
    }

    Ok(())
}

fn match_live_stop(
    live_stop: &LiveStop,
    static_stops: &[StopRecord],
    settings: ReconcileSettings,
    reconciliation: &mut Reconciliation,
) {
    debug!(
        "attempting to match live stop {} {} served by {} routes",
        live_stop.id,
        live_stop.name,
        live_stop.routes.len()
    );

    let candidates = static_stops
        .iter()
        .map(|stop| CandidateMatch {
            stop,
            distance: haversine_meters(live_stop.location, stop.location),
        })
        .collect_vec();

    // stable sort, equal distances keep the GTFS file order
    let matches = candidates
        .iter()
        .filter(|c| c.distance < settings.tolerance_meters)
        .sorted_by(|a, b| a.distance.total_cmp(&b.distance))
        .collect_vec();

    let Some(best) = matches.first() else {
        let nearest = candidates
            .iter()
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
            .map(|c| (c.stop.id.clone(), c.distance));

        let diagnostic = Diagnostic::NoMatchFound {
            live_stop_id: live_stop.id.clone(),
            live_stop_name: live_stop.name.clone(),
            nearest,
        };
        warn!("{diagnostic}");
        reconciliation.diagnostics.push(diagnostic);
        return;
    };

    info!(
        "best match for {} {} is GTFS stop {} {} at {:.1} meters",
        live_stop.id, live_stop.name, best.stop.id, best.stop.name, best.distance
    );

    let threshold = best.distance * settings.ambiguity_factor;
    if matches.get(1).is_some_and(|second| second.distance < threshold) {
        let diagnostic = Diagnostic::AmbiguousMatch {
            live_stop_id: live_stop.id.clone(),
            best_stop_id: best.stop.id.clone(),
            candidates: matches.iter().filter(|c| c.distance < threshold).count(),
            threshold_meters: threshold,
        };
        warn!("{diagnostic}");
        reconciliation.diagnostics.push(diagnostic);
    }

    if let Some(previous) = reconciliation
        .mapping
        .insert(best.stop.id.clone(), live_stop.id.clone())
    {
        let diagnostic = Diagnostic::MappingOverwritten {
            static_stop_id: best.stop.id.clone(),
            previous_live_stop_id: previous,
            live_stop_id: live_stop.id.clone(),
        };
        warn!("{diagnostic}");
        reconciliation.diagnostics.push(diagnostic);
    }
}
