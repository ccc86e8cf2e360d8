use std::fs::File;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::StagedFile;
use crate::error::{Degradation, FocosError, Stage, Staged};
use crate::table::{Table, Value};

pub const LAT_COLUMN: &str = "lat";
pub const LON_COLUMN: &str = "lon";
/// Column written by spreadsheet tools when a frame index was saved.
pub const INDEX_ARTIFACT: &str = "Unnamed: 0";
/// Historical misnaming of the longitude column in some monthly exports.
pub const LON_ALIAS: &str = "M";
pub const TARGET_EPSG: u32 = 4326;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub lon: f64,
    pub lat: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Bounds {
    pub fn contains(&self, point: Coordinate) -> bool {
        point.lon >= self.west
            && point.lon <= self.east
            && point.lat >= self.south
            && point.lat <= self.north
    }
}

/// Unified observation points in EPSG:4326. `points[i]` is the geometry of
/// row `i` of `table`.
#[derive(Debug, Clone, PartialEq)]
pub struct PointDataset {
    pub table: Table,
    pub points: Vec<Coordinate>,
}

impl PointDataset {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn epsg(&self) -> u32 {
        TARGET_EPSG
    }

    pub fn bounds(&self) -> Option<Bounds> {
        let first = self.points.first()?;
        let mut bounds = Bounds {
            north: first.lat,
            south: first.lat,
            east: first.lon,
            west: first.lon,
        };
        for point in &self.points[1..] {
            bounds.north = bounds.north.max(point.lat);
            bounds.south = bounds.south.min(point.lat);
            bounds.east = bounds.east.max(point.lon);
            bounds.west = bounds.west.min(point.lon);
        }
        Some(bounds)
    }
}

#[derive(Debug, Default)]
pub struct Consolidator;

impl Consolidator {
    pub fn new() -> Self {
        Self
    }

    /// Loads every staged file, merges them and builds the point dataset.
    /// Unreadable or empty files are reported, not fatal.
    pub fn consolidate(&self, files: &[StagedFile]) -> Result<Staged<PointDataset>, FocosError> {
        let mut degradations = Vec::new();
        let mut tables = Vec::new();

        for file in files {
            match read_table(file) {
                Ok(table) if table.is_empty() => {
                    warn!(file = %file.remote_name, "skipping file without rows");
                    degradations.push(Degradation::for_item(
                        Stage::Consolidate,
                        &file.remote_name,
                        "file has no data rows",
                    ));
                }
                Ok(table) => {
                    info!(file = %file.remote_name, rows = table.row_count(), "loaded observations");
                    tables.push(table);
                }
                Err(err) => {
                    warn!(file = %file.remote_name, error = %err, "skipping unreadable file");
                    degradations.push(Degradation::for_item(
                        Stage::Consolidate,
                        &file.remote_name,
                        err.to_string(),
                    ));
                }
            }
        }

        if tables.is_empty() {
            return Err(FocosError::NoValidRows);
        }

        let mut table = Table::concat(tables);
        normalize_columns(&mut table);

        for required in [LAT_COLUMN, LON_COLUMN] {
            if !table.has_column(required) {
                return Err(FocosError::MissingCoordinateColumns(required.to_string()));
            }
        }

        let points = drop_rows_without_coordinates(&mut table);
        if points.is_empty() {
            return Err(FocosError::NoValidRows);
        }
        debug!(rows = points.len(), "built point dataset");

        Ok(Staged::with(PointDataset { table, points }, degradations))
    }
}

/// Drops the index artifact and folds the longitude alias into `lon`.
pub fn normalize_columns(table: &mut Table) {
    table.drop_column(INDEX_ARTIFACT);
    if table.has_column(LON_ALIAS) {
        if table.has_column(LON_COLUMN) {
            table.coalesce_into(LON_ALIAS, LON_COLUMN);
        } else {
            table.rename_column(LON_ALIAS, LON_COLUMN);
        }
    }
}

fn drop_rows_without_coordinates(table: &mut Table) -> Vec<Coordinate> {
    let (Some(lats), Some(lons)) = (table.column(LAT_COLUMN), table.column(LON_COLUMN)) else {
        return Vec::new();
    };
    let coords: Vec<Option<Coordinate>> = lats
        .iter()
        .zip(lons)
        .map(|(lat, lon)| match (lat.as_f64(), lon.as_f64()) {
            (Some(lat), Some(lon)) => Some(Coordinate { lon, lat }),
            _ => None,
        })
        .collect();
    let keep: Vec<bool> = coords.iter().map(Option::is_some).collect();
    let dropped = keep.iter().filter(|flag| !**flag).count();
    if dropped > 0 {
        info!(dropped, "dropped rows without coordinates");
    }
    table.retain_rows(&keep);
    coords.into_iter().flatten().collect()
}

/// Parses one delimited file into a table. Headers are made unique and blank
/// header cells get the `Unnamed: <position>` label.
pub fn read_table(file: &StagedFile) -> Result<Table, FocosError> {
    let parse_err = |message: String| FocosError::TabularParse {
        file: file.remote_name.clone(),
        message,
    };
    let handle = File::open(file.path.as_std_path()).map_err(|err| parse_err(err.to_string()))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(handle);

    let headers = reader
        .headers()
        .map_err(|err| parse_err(err.to_string()))?
        .clone();
    if headers.is_empty() || headers.iter().all(|cell| cell.trim().is_empty()) {
        return Err(parse_err("no columns to parse".to_string()));
    }
    let header = unique_headers(headers.iter());

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| parse_err(err.to_string()))?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        records.push(record.iter().map(Value::infer).collect::<Vec<_>>());
    }
    Ok(Table::from_records(&header, records))
}

fn unique_headers<'a>(cells: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut header: Vec<String> = Vec::new();
    for (position, cell) in cells.enumerate() {
        let cell = cell.trim().trim_start_matches('\u{feff}');
        let base = if cell.is_empty() {
            format!("Unnamed: {position}")
        } else {
            cell.to_string()
        };
        let mut name = base.clone();
        let mut suffix = 1;
        while header.contains(&name) {
            name = format!("{base}.{suffix}");
            suffix += 1;
        }
        header.push(name);
    }
    header
}
