#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Duration, TimeZone, Utc};
use gdal::vector::Geometry;
use indexmap::IndexMap;

use focos_enricher::config::RunSettings;
use focos_enricher::consolidate::PointDataset;
use focos_enricher::domain::{RemoteResource, ResourceKind, StagedLayer};
use focos_enricher::error::FocosError;
use focos_enricher::export::ExportWriter;
use focos_enricher::layers::{LayerLoader, RawFeature, RawLayer};
use focos_enricher::pipeline::{ProgressEvent, ProgressSink};
use focos_enricher::table::{Table, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Upload { parent: String, name: String },
    Update { id: String },
    Delete { id: String },
    Grant { id: String },
}

struct Entry {
    resource: RemoteResource,
    content: Vec<u8>,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    next_id: usize,
    calls: Vec<Call>,
}

/// In-memory folder tree standing in for the remote store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failing_downloads: Mutex<HashSet<String>>,
    fail_grants: Mutex<bool>,
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &self,
        parent: Option<&str>,
        name: &str,
        kind: ResourceKind,
        content: Vec<u8>,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("id-{}", state.next_id);
        let created_at = epoch() + Duration::minutes(state.next_id as i64);
        state.entries.push(Entry {
            resource: RemoteResource {
                id: id.clone(),
                name: name.to_string(),
                parent: parent.map(str::to_string),
                size: Some(content.len() as u64),
                created_at: Some(created_at),
                kind,
            },
            content,
        });
        id
    }

    pub fn folder(&self, name: &str, parent: Option<&str>) -> String {
        self.insert(parent, name, ResourceKind::Folder, Vec::new())
    }

    pub fn file(&self, parent: &str, name: &str, content: &[u8]) -> String {
        self.insert(Some(parent), name, ResourceKind::File, content.to_vec())
    }

    /// Adds the three essential parts plus a projection file for `base`.
    pub fn shapefile(&self, parent: &str, base: &str) -> HashMap<String, String> {
        [".shp", ".shx", ".dbf", ".prj"]
            .into_iter()
            .map(|ext| {
                let name = format!("{base}{ext}");
                let id = self.file(parent, &name, b"part");
                (ext.to_string(), id)
            })
            .collect()
    }

    pub fn fail_download(&self, id: &str) {
        self.failing_downloads.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_grants(&self) {
        *self.fail_grants.lock().unwrap() = true;
    }

    pub fn files_in(&self, parent: &str) -> Vec<RemoteResource> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|entry| entry.resource.parent.as_deref() == Some(parent))
            .filter(|entry| !entry.resource.is_folder())
            .map(|entry| entry.resource.clone())
            .collect()
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .find(|entry| entry.resource.id == id)
            .map(|entry| entry.content.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl focos_enricher::remote::RemoteStore for MemoryStore {
    fn list_folders(&self) -> Result<Vec<RemoteResource>, FocosError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .filter(|entry| entry.resource.is_folder())
            .map(|entry| entry.resource.clone())
            .collect())
    }

    fn list(
        &self,
        parent: Option<&str>,
        name_contains: Option<&str>,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<RemoteResource>, FocosError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .map(|entry| &entry.resource)
            .filter(|resource| parent.is_none() || resource.parent.as_deref() == parent)
            .filter(|resource| {
                name_contains.is_none_or(|needle| {
                    resource.name.to_lowercase().contains(&needle.to_lowercase())
                })
            })
            .filter(|resource| kind.is_none_or(|kind| resource.kind == kind))
            .cloned()
            .collect())
    }

    fn download(&self, id: &str, sink: &mut dyn Write) -> Result<u64, FocosError> {
        if self.failing_downloads.lock().unwrap().contains(id) {
            return Err(FocosError::RemoteStatus {
                status: 500,
                message: format!("download of {id} failed"),
            });
        }
        let content = self.content(id).ok_or_else(|| FocosError::RemoteStatus {
            status: 404,
            message: format!("{id} not found"),
        })?;
        sink.write_all(&content)
            .map_err(|err| FocosError::Filesystem(err.to_string()))?;
        Ok(content.len() as u64)
    }

    fn upload(&self, parent: &str, name: &str, source: &Path) -> Result<String, FocosError> {
        let content = fs::read(source).map_err(|err| FocosError::Filesystem(err.to_string()))?;
        let id = self.insert(Some(parent), name, ResourceKind::File, content);
        self.state.lock().unwrap().calls.push(Call::Upload {
            parent: parent.to_string(),
            name: name.to_string(),
        });
        Ok(id)
    }

    fn update_content(&self, id: &str, source: &Path) -> Result<String, FocosError> {
        let content = fs::read(source).map_err(|err| FocosError::Filesystem(err.to_string()))?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|entry| entry.resource.id == id)
            .ok_or_else(|| FocosError::RemoteStatus {
                status: 404,
                message: format!("{id} not found"),
            })?;
        entry.resource.size = Some(content.len() as u64);
        entry.content = content;
        state.calls.push(Call::Update { id: id.to_string() });
        Ok(id.to_string())
    }

    fn delete(&self, id: &str) -> Result<(), FocosError> {
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|entry| entry.resource.id != id);
        state.calls.push(Call::Delete { id: id.to_string() });
        Ok(())
    }

    fn grant_public_read(&self, id: &str) -> Result<(), FocosError> {
        if *self.fail_grants.lock().unwrap() {
            return Err(FocosError::RemoteStatus {
                status: 403,
                message: "permission denied".to_string(),
            });
        }
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::Grant { id: id.to_string() });
        Ok(())
    }
}

/// What the recording writer saw for one workbook.
#[derive(Debug, Clone)]
pub struct WrittenTable {
    pub path: Utf8PathBuf,
    pub columns: Vec<String>,
    pub rows: usize,
    pub table: Table,
}

/// Export writer that dumps column names to plain files and keeps every
/// table it was asked to encode.
#[derive(Clone, Default)]
pub struct RecordingWriter {
    pub workbooks: Arc<Mutex<Vec<WrittenTable>>>,
    pub vectors: Arc<Mutex<Vec<WrittenTable>>>,
    fail_vector: bool,
}

impl RecordingWriter {
    /// A writer whose vector encoder always fails.
    pub fn failing_vector() -> Self {
        Self {
            fail_vector: true,
            ..Self::default()
        }
    }

    pub fn last_workbook(&self) -> Option<WrittenTable> {
        self.workbooks.lock().unwrap().last().cloned()
    }
}

impl ExportWriter for RecordingWriter {
    fn write_workbook(&self, table: &Table, path: &Utf8Path) -> Result<(), FocosError> {
        fs::write(path.as_std_path(), table.column_names().join(","))
            .map_err(|err| FocosError::Export(err.to_string()))?;
        self.workbooks.lock().unwrap().push(WrittenTable {
            path: path.to_path_buf(),
            columns: table.column_names(),
            rows: table.row_count(),
            table: table.clone(),
        });
        Ok(())
    }

    fn write_vector(
        &self,
        dataset: &PointDataset,
        path: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, FocosError> {
        if self.fail_vector {
            return Err(FocosError::Export(format!("cannot encode {path}")));
        }
        let mut written = Vec::new();
        for ext in ["shp", "shx", "dbf", "prj"] {
            let part = path.with_extension(ext);
            fs::write(part.as_std_path(), ext).map_err(|err| FocosError::Export(err.to_string()))?;
            written.push(part);
        }
        self.vectors.lock().unwrap().push(WrittenTable {
            path: path.to_path_buf(),
            columns: dataset.table.column_names(),
            rows: dataset.len(),
            table: dataset.table.clone(),
        });
        Ok(written)
    }
}

pub struct WktFeature {
    pub wkt: String,
    pub attributes: Vec<(String, Value)>,
}

/// Layer loader serving WKT polygons keyed by layer base name.
#[derive(Default)]
pub struct WktLoader {
    layers: HashMap<String, (Vec<String>, Vec<WktFeature>)>,
}

impl WktLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, base: &str, fields: &[&str], features: Vec<WktFeature>) -> Self {
        self.layers.insert(
            base.to_string(),
            (fields.iter().map(|field| field.to_string()).collect(), features),
        );
        self
    }
}

impl LayerLoader for WktLoader {
    fn load(&self, layer: &StagedLayer) -> Result<RawLayer, FocosError> {
        let (fields, features) = self
            .layers
            .get(&layer.base_name)
            .ok_or_else(|| FocosError::Spatial(format!("no fixture for {}", layer.base_name)))?;
        let mut raw = Vec::new();
        for feature in features {
            let attributes: IndexMap<String, Value> = feature.attributes.iter().cloned().collect();
            raw.push(RawFeature {
                geometry: Some(Geometry::from_wkt(&feature.wkt)?),
                attributes,
            });
        }
        Ok(RawLayer {
            srs: None,
            fields: fields.clone(),
            features: raw,
        })
    }
}

pub fn square(west: f64, south: f64, size: f64) -> String {
    let (east, north) = (west + size, south + size);
    format!("POLYGON (({west} {south}, {east} {south}, {east} {north}, {west} {north}, {west} {south}))")
}

pub fn feature(wkt: String, attributes: &[(&str, &str)]) -> WktFeature {
    WktFeature {
        wkt,
        attributes: attributes
            .iter()
            .map(|(name, value)| (name.to_string(), Value::Text(value.to_string())))
            .collect(),
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

/// Settings that keep every local write inside `dir`.
pub fn settings_in(dir: &Path) -> RunSettings {
    let data = Utf8PathBuf::from_path_buf(dir.join("data")).unwrap();
    RunSettings {
        staging_parent: Some(dir.to_path_buf()),
        descriptor_path: data.join("current_data_link.json"),
        output_dir: data,
        ..RunSettings::default()
    }
}
