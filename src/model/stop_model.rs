use std::fmt;

/// A point in decimal degrees.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Coordinates {
            latitude,
            longitude,
        }
    }

    /// Finite and inside the usual latitude/longitude ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}

/// A stop read from the `stops.txt` table of a GTFS archive.
#[derive(Clone, Debug, PartialEq)]
pub struct StopRecord {
    /// `stop_id`, unique within the archive
    pub id: String,
    pub name: String,
    pub location: Coordinates,
}

/// A stop as reported by the live-location service.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveStop {
    /// Unique within an agency
    pub id: String,
    pub name: String,
    pub location: Coordinates,
    /// Route ids serving the stop. Informational only.
    pub routes: Vec<String>,
}
