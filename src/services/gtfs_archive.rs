//! Reads stops out of a GTFS zip and writes a copy with remapped stop ids
use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use csv::StringRecord;
use itertools::Itertools;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zip::{CompressionMethod, ZipArchive, ZipWriter, result::ZipError, write::SimpleFileOptions};

use crate::model::stop_model::{Coordinates, StopRecord};

pub const STOPS_TABLE: &str = "stops.txt";

/// Tables and columns besides `stops.txt`'s `stop_id` that hold stop ids
const STOP_REFERENCES: &[(&str, &[&str])] = &[
    (STOPS_TABLE, &["parent_station"]),
    ("stop_times.txt", &["stop_id"]),
    ("transfers.txt", &["from_stop_id", "to_stop_id"]),
    ("pathways.txt", &["from_stop_id", "to_stop_id"]),
];

/// Upper bound on the buffer reserved up front from a zip entry's declared size
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// `location_type` values that are allowed to have no coordinates
const GENERIC_NODE: &str = "3";
const BOARDING_AREA: &str = "4";

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("error accessing {}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("error reading the GTFS zip")]
    Zip(#[from] ZipError),

    #[error("error processing {table}")]
    Csv { table: String, source: csv::Error },

    #[error("{table} is missing from the GTFS zip")]
    MissingTable { table: String },

    #[error("{table} has no {column} column")]
    MissingColumn { table: String, column: String },

    #[error("stop {stop_id} has malformed {column} {value:?}")]
    MalformedRecord {
        stop_id: String,
        column: &'static str,
        value: String,
    },
}

#[derive(Clone, Debug, Default)]
pub struct RewriteOptions {
    /// Also rewrite `parent_station` and the tables referring to stops
    pub rewrite_references: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RewriteSummary {
    /// Rows of `stops.txt` whose `stop_id` changed
    pub remapped_stops: usize,
    /// Stop id references changed in other columns and tables
    pub rewritten_references: usize,
    /// `stop_id`s that occur more than once in the rewritten `stops.txt`
    pub duplicate_stop_ids: Vec<String>,
}

pub struct GtfsArchive {
    path: PathBuf,
    archive: ZipArchive<File>,
}

impl GtfsArchive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| ArchiveError::Io {
            path: path.clone(),
            source,
        })?;
        let archive = ZipArchive::new(file)?;

        Ok(GtfsArchive { path, archive })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[tracing::instrument(err, skip(self), fields(path = %self.path.display()))]
    pub fn stops(&mut self) -> Result<Vec<StopRecord>, ArchiveError> {
        let table = self
            .read_table(STOPS_TABLE)?
            .ok_or_else(|| ArchiveError::MissingTable {
                table: STOPS_TABLE.to_string(),
            })?;

        let stops = parse_stops(&table)?;

        info!("got {} stops from {}", stops.len(), self.path.display());

        Ok(stops)
    }

    /// Writes a copy of the archive to `destination` with the stop ids in `mapping` replaced.
    /// Entries that aren't rewritten are copied without recompressing them.
    ///
    /// The copy is written next to `destination` and moved over it once complete, so
    /// `destination` may be the archive being read. It gets the permissions of the file it
    /// replaces, or of the source archive when `destination` is new.
    #[tracing::instrument(err, skip(self, mapping), fields(path = %self.path.display()))]
    pub fn write_remapped(
        mut self,
        mapping: &HashMap<String, String>,
        options: &RewriteOptions,
        destination: &Path,
    ) -> Result<RewriteSummary, ArchiveError> {
        let mut summary = RewriteSummary::default();
        let mut rewritten: HashMap<String, Vec<u8>> = HashMap::new();

        let stops = self
            .read_table(STOPS_TABLE)?
            .ok_or_else(|| ArchiveError::MissingTable {
                table: STOPS_TABLE.to_string(),
            })?;
        let stops = rewrite_table(STOPS_TABLE, &stops, &["stop_id"], mapping, true)?;
        summary.remapped_stops = stops.replaced;
        summary.duplicate_stop_ids = stops.duplicates;
        rewritten.insert(STOPS_TABLE.to_string(), stops.data);

        if options.rewrite_references {
            for (table, columns) in STOP_REFERENCES {
                let data = match rewritten.remove(*table) {
                    Some(data) => data,
                    None => match self.read_table(table)? {
                        Some(data) => data,
                        None => continue,
                    },
                };

                let table_rewrite = rewrite_table(table, &data, columns, mapping, false)?;
                debug!("rewrote {} stop references in {}", table_rewrite.replaced, table);
                summary.rewritten_references += table_rewrite.replaced;
                rewritten.insert(table.to_string(), table_rewrite.data);
            }
        }

        for stop_id in &summary.duplicate_stop_ids {
            warn!("stop_id {} occurs more than once in the rewritten {}", stop_id, STOPS_TABLE);
        }

        let output = self.write_archive(rewritten, destination)?;

        // The source has to be closed before it can be replaced on every platform
        let GtfsArchive { path, archive } = self;
        drop(archive);

        persist(output, &path, destination)?;

        Ok(summary)
    }

    fn read_table(&mut self, table: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
        let mut file = match self.archive.by_name(table) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut data = Vec::with_capacity(preallocation(file.size()));
        file.read_to_end(&mut data).map_err(|source| ArchiveError::Io {
            path: self.path.join(table),
            source,
        })?;

        Ok(Some(data))
    }

    fn write_archive(
        &mut self,
        mut rewritten: HashMap<String, Vec<u8>>,
        destination: &Path,
    ) -> Result<NamedTempFile, ArchiveError> {
        let io_error = |source| ArchiveError::Io {
            path: destination.to_path_buf(),
            source,
        };

        let directory = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut output = NamedTempFile::new_in(directory).map_err(io_error)?;

        let mut writer = ZipWriter::new(output.as_file_mut());

        for i in 0..self.archive.len() {
            let entry = self.archive.by_index_raw(i)?;

            match rewritten.remove(entry.name()) {
                Some(data) => {
                    let name = entry.name().to_string();
                    writer.start_file(
                        name,
                        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
                    )?;
                    writer.write_all(&data).map_err(io_error)?;
                }
                None => writer.raw_copy_file(entry)?,
            }
        }

        writer.finish()?;

        Ok(output)
    }
}

fn preallocation(declared_size: u64) -> usize {
    declared_size.min(MAX_PREALLOCATION) as usize
}

/// Moves the finished copy over `destination`, keeping the permissions of the file it
/// replaces. A new `destination` takes the permissions of `source`.
fn persist(output: NamedTempFile, source: &Path, destination: &Path) -> Result<(), ArchiveError> {
    let io_error = |path: &Path, error| ArchiveError::Io {
        path: path.to_path_buf(),
        source: error,
    };

    let permissions = match std::fs::metadata(destination) {
        Ok(metadata) => metadata.permissions(),
        Err(e) if e.kind() == ErrorKind::NotFound => std::fs::metadata(source)
            .map_err(|e| io_error(source, e))?
            .permissions(),
        Err(e) => return Err(io_error(destination, e)),
    };

    output
        .as_file()
        .set_permissions(permissions)
        .map_err(|e| io_error(destination, e))?;

    output
        .persist(destination)
        .map_err(|e| io_error(destination, e.error))?;

    Ok(())
}

/// Parses a `stops.txt` table. Stops that may omit coordinates and do are left out.
pub fn parse_stops(data: &[u8]) -> Result<Vec<StopRecord>, ArchiveError> {
    let csv_error = |source| ArchiveError::Csv {
        table: STOPS_TABLE.to_string(),
        source,
    };

    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(data);
    let headers = rdr.headers().map_err(csv_error)?.clone();

    let idx_id = required_column(&headers, STOPS_TABLE, "stop_id")?;
    let idx_lat = required_column(&headers, STOPS_TABLE, "stop_lat")?;
    let idx_lon = required_column(&headers, STOPS_TABLE, "stop_lon")?;
    let idx_name = column_index(&headers, "stop_name");
    let idx_location_type = column_index(&headers, "location_type");

    let mut stops = vec![];
    let mut skipped = 0usize;

    for result in rdr.records() {
        let record = result.map_err(csv_error)?;
        let field = |idx: usize| record.get(idx).unwrap_or("").trim();

        let stop_id = field(idx_id).to_string();
        let latitude = field(idx_lat);
        let longitude = field(idx_lon);

        let location_type = idx_location_type.map(field).unwrap_or("");
        if latitude.is_empty()
            && longitude.is_empty()
            && (location_type == GENERIC_NODE || location_type == BOARDING_AREA)
        {
            skipped += 1;
            continue;
        }

        let location = Coordinates::new(
            parse_coordinate(&stop_id, "stop_lat", latitude)?,
            parse_coordinate(&stop_id, "stop_lon", longitude)?,
        );

        stops.push(StopRecord {
            name: idx_name.map(field).unwrap_or("").to_string(),
            id: stop_id,
            location,
        });
    }

    if skipped > 0 {
        debug!(skipped, "Skipped generic nodes and boarding areas without coordinates");
    }

    Ok(stops)
}

fn parse_coordinate(stop_id: &str, column: &'static str, value: &str) -> Result<f64, ArchiveError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ArchiveError::MalformedRecord {
            stop_id: stop_id.to_string(),
            column,
            value: value.to_string(),
        })
}

/// Header lookup ignoring surrounding whitespace and a UTF-8 byte order mark
fn column_index(headers: &StringRecord, column: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim_start_matches('\u{feff}').trim() == column)
}

fn required_column(headers: &StringRecord, table: &str, column: &str) -> Result<usize, ArchiveError> {
    column_index(headers, column).ok_or_else(|| ArchiveError::MissingColumn {
        table: table.to_string(),
        column: column.to_string(),
    })
}

struct TableRewrite {
    data: Vec<u8>,
    replaced: usize,
    /// Only filled when the first column is checked for duplicates
    duplicates: Vec<String>,
}

/// Replaces the values of `columns` found in `mapping`, leaving every other byte of
/// meaning untouched: same headers, same column order, same row order.
/// Missing columns are skipped except the first one of `stops.txt`.
fn rewrite_table(
    table: &str,
    data: &[u8],
    columns: &[&str],
    mapping: &HashMap<String, String>,
    check_duplicates: bool,
) -> Result<TableRewrite, ArchiveError> {
    let csv_error = |source| ArchiveError::Csv {
        table: table.to_string(),
        source,
    };

    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(data);
    let headers = rdr.headers().map_err(csv_error)?.clone();

    let indices = if check_duplicates {
        columns
            .iter()
            .map(|c| required_column(&headers, table, c))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        columns
            .iter()
            .filter_map(|c| column_index(&headers, c))
            .collect_vec()
    };

    let mut wtr = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(vec![]);
    wtr.write_record(&headers).map_err(csv_error)?;

    let mut replaced = 0usize;
    let mut first_column_values = vec![];

    for result in rdr.records() {
        let record = result.map_err(csv_error)?;

        let new_record: StringRecord = record
            .iter()
            .enumerate()
            .map(|(i, value)| {
                if indices.contains(&i) {
                    if let Some(new_value) = mapping.get(value.trim()) {
                        replaced += 1;
                        return new_value.as_str();
                    }
                }
                value
            })
            .collect();

        if check_duplicates {
            if let Some(value) = indices.first().and_then(|&i| new_record.get(i)) {
                first_column_values.push(value.trim().to_string());
            }
        }

        wtr.write_record(&new_record).map_err(csv_error)?;
    }

    let data = wtr.into_inner().map_err(|e| ArchiveError::Io {
        path: PathBuf::from(table),
        source: e.into_error(),
    })?;

    let duplicates = first_column_values
        .into_iter()
        .duplicates()
        .sorted()
        .collect_vec();

    Ok(TableRewrite {
        data,
        replaced,
        duplicates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const STOPS: &str = "\u{feff}stop_id,stop_code,stop_name,stop_lat,stop_lon,location_type,parent_station\n\
        S1,101,Main St,35.910805,-79.053026,0,P1\n\
        S2,102,\"Franklin St, north side\",35.9,-79.05,0,\n\
        P1,,Main Station,35.91,-79.053,1,\n\
        N1,,Node,,,3,P1\n";

    const STOP_TIMES: &str = "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
        T1,08:00:00,08:00:00,S1,1\n\
        T1,08:05:00,08:05:00,S2,2\n";

    const AGENCY: &str = "agency_id,agency_name,agency_url,agency_timezone\n\
        A,Chapel Hill Transit,https://example.com,America/New_York\n";

    fn build_zip(path: &Path, files: &[(&str, &str)]) -> anyhow::Result<()> {
        let mut writer = ZipWriter::new(File::create(path)?);
        for (name, content) in files {
            writer.start_file(*name, SimpleFileOptions::default())?;
            writer.write_all(content.as_bytes())?;
        }
        writer.finish()?;

        Ok(())
    }

    fn read_entry(path: &Path, name: &str) -> anyhow::Result<String> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        let mut content = String::new();
        archive.by_name(name)?.read_to_string(&mut content)?;

        Ok(content)
    }

    fn mapping(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_stops() -> anyhow::Result<()> {
        let stops = parse_stops(STOPS.as_bytes())?;

        assert_eq!(stops.len(), 3);
        assert_eq!(stops[0].id, "S1");
        assert_eq!(stops[0].name, "Main St");
        assert_eq!(stops[0].location, Coordinates::new(35.910805, -79.053026));
        assert_eq!(stops[1].name, "Franklin St, north side");
        assert_eq!(stops[2].id, "P1");

        Ok(())
    }

    #[test]
    fn test_parse_stops_malformed_coordinate() {
        let table = "stop_id,stop_name,stop_lat,stop_lon\nS1,Main St,35.9,-79.05\nS2,Bad,north,-79.05\n";

        match parse_stops(table.as_bytes()) {
            Err(ArchiveError::MalformedRecord {
                stop_id,
                column,
                value,
            }) => {
                assert_eq!(stop_id, "S2");
                assert_eq!(column, "stop_lat");
                assert_eq!(value, "north");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_parse_stops_empty_coordinate_on_regular_stop() {
        let table = "stop_id,stop_name,stop_lat,stop_lon\nS1,Main St,35.9,\n";

        assert!(matches!(
            parse_stops(table.as_bytes()),
            Err(ArchiveError::MalformedRecord { column: "stop_lon", .. })
        ));
    }

    #[test]
    fn test_parse_stops_missing_column() {
        let table = "stop_id,stop_name,stop_lat\nS1,Main St,35.9\n";

        assert!(matches!(
            parse_stops(table.as_bytes()),
            Err(ArchiveError::MissingColumn { ref column, .. }) if column == "stop_lon"
        ));
    }

    #[test]
    fn test_rewrite_table_keeps_columns_and_order() -> anyhow::Result<()> {
        let result = rewrite_table(
            STOPS_TABLE,
            STOPS.as_bytes(),
            &["stop_id"],
            &mapping(&[("S1", "4098206"), ("P1", "S2")]),
            true,
        )?;

        assert_eq!(result.replaced, 2);
        assert_eq!(result.duplicates, vec!["S2"]);

        let mut rdr = csv::Reader::from_reader(Cursor::new(result.data));
        let headers = rdr.headers()?.clone();
        assert_eq!(headers.len(), 7);
        assert_eq!(column_index(&headers, "parent_station"), Some(6));

        let rows: Vec<StringRecord> = rdr.records().collect::<Result<_, _>>()?;
        let ids = rows.iter().map(|r| r[0].to_string()).collect_vec();
        assert_eq!(ids, vec!["4098206", "S2", "S2", "N1"]);
        // parent_station is only touched when references are rewritten
        assert_eq!(&rows[0][6], "P1");
        assert_eq!(&rows[1][2], "Franklin St, north side");

        Ok(())
    }

    #[test]
    fn test_write_remapped_in_place() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gtfs.zip");
        build_zip(
            &path,
            &[
                ("agency.txt", AGENCY),
                (STOPS_TABLE, STOPS),
                ("stop_times.txt", STOP_TIMES),
            ],
        )?;

        let archive = GtfsArchive::open(&path)?;
        let summary = archive.write_remapped(
            &mapping(&[("S1", "4098206"), ("S2", "4098210")]),
            &RewriteOptions::default(),
            &path,
        )?;

        assert_eq!(
            summary,
            RewriteSummary {
                remapped_stops: 2,
                rewritten_references: 0,
                duplicate_stop_ids: vec![],
            }
        );

        let stops = parse_stops(read_entry(&path, STOPS_TABLE)?.as_bytes())?;
        let ids = stops.iter().map(|s| s.id.as_str()).collect_vec();
        assert_eq!(ids, vec!["4098206", "4098210", "P1"]);

        assert_eq!(read_entry(&path, "agency.txt")?, AGENCY);
        assert_eq!(read_entry(&path, "stop_times.txt")?, STOP_TIMES);

        let mut archive = ZipArchive::new(File::open(&path)?)?;
        let names = (0..archive.len())
            .map(|i| archive.by_index(i).map(|f| f.name().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(names, vec!["agency.txt", STOPS_TABLE, "stop_times.txt"]);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_write_remapped_in_place_keeps_permissions() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gtfs.zip");
        build_zip(&path, &[(STOPS_TABLE, STOPS)])?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;

        let archive = GtfsArchive::open(&path)?;
        archive.write_remapped(&mapping(&[("S1", "X")]), &RewriteOptions::default(), &path)?;

        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_write_remapped_new_destination_takes_source_permissions() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let source = dir.path().join("gtfs.zip");
        let destination = dir.path().join("rectified.zip");
        build_zip(&source, &[(STOPS_TABLE, STOPS)])?;
        std::fs::set_permissions(&source, std::fs::Permissions::from_mode(0o640))?;

        let archive = GtfsArchive::open(&source)?;
        archive.write_remapped(&mapping(&[("S1", "X")]), &RewriteOptions::default(), &destination)?;

        let mode = std::fs::metadata(&destination)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        Ok(())
    }

    #[test]
    fn test_preallocation_is_capped() {
        assert_eq!(preallocation(1024), 1024);
        assert_eq!(preallocation(u64::MAX), MAX_PREALLOCATION as usize);
    }

    #[test]
    fn test_write_remapped_rewrites_references() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("gtfs.zip");
        let destination = dir.path().join("rectified.zip");
        build_zip(
            &source,
            &[(STOPS_TABLE, STOPS), ("stop_times.txt", STOP_TIMES)],
        )?;

        let archive = GtfsArchive::open(&source)?;
        let summary = archive.write_remapped(
            &mapping(&[("S1", "4098206"), ("P1", "4000001")]),
            &RewriteOptions {
                rewrite_references: true,
            },
            &destination,
        )?;

        assert_eq!(summary.remapped_stops, 2);
        // two parent_station values and one stop_times row
        assert_eq!(summary.rewritten_references, 3);

        let stop_times = read_entry(&destination, "stop_times.txt")?;
        assert!(stop_times.contains("T1,08:00:00,08:00:00,4098206,1"));
        assert!(stop_times.contains("T1,08:05:00,08:05:00,S2,2"));

        let stops = read_entry(&destination, STOPS_TABLE)?;
        assert!(stops.contains("4098206,101,Main St,35.910805,-79.053026,0,4000001"));
        assert!(stops.contains("N1,,Node,,,3,4000001"));

        // the source is left alone
        assert_eq!(read_entry(&source, STOPS_TABLE)?, STOPS);

        Ok(())
    }

    #[test]
    fn test_missing_stops_table() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gtfs.zip");
        build_zip(&path, &[("agency.txt", AGENCY)])?;

        let mut archive = GtfsArchive::open(&path)?;

        assert!(matches!(
            archive.stops(),
            Err(ArchiveError::MissingTable { .. })
        ));

        Ok(())
    }
}
