use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local, Utc};
use gdal::{DriverManager, LayerOptions};
use gdal::vector::{
    Feature, FieldDefn, FieldValue, LayerAccess, OGRFieldType, OGRwkbGeometryType,
};
use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::RunSettings;
use crate::consolidate::{Bounds, PointDataset};
use crate::domain::{RemoteResource, ResourceKind};
use crate::error::{Degradation, FocosError, Stage, Staged};
use crate::fetch::LAYER_EXTENSIONS;
use crate::fs_util::{ensure_dir, write_json_atomic};
use crate::layers::{point_geometry, target_srs};
use crate::remote::{RemoteStore, public_download_url};
use crate::table::{ColumnType, Table, Value};

/// Widest text field a shapefile attribute table can hold, in bytes.
pub const MAX_TEXT_WIDTH: usize = 254;

/// Encoders for the two export formats.
pub trait ExportWriter {
    /// Tabular form, no geometry.
    fn write_workbook(&self, table: &Table, path: &Utf8Path) -> Result<(), FocosError>;
    /// Vector form with point geometry. Returns every file written.
    fn write_vector(
        &self,
        dataset: &PointDataset,
        path: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, FocosError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GdalExportWriter;

impl ExportWriter for GdalExportWriter {
    fn write_workbook(&self, table: &Table, path: &Utf8Path) -> Result<(), FocosError> {
        remove_stale(path)?;
        let driver = DriverManager::get_driver_by_name("XLSX")?;
        let mut dataset = driver.create_vector_only(path.as_std_path())?;
        let layer = dataset.create_layer(LayerOptions {
            name: "focos",
            ty: OGRwkbGeometryType::wkbNone,
            ..Default::default()
        })?;
        let fields = define_fields(&layer, table, None)?;
        for row in 0..table.row_count() {
            let mut feature = Feature::new(layer.defn())?;
            fill_row(&mut feature, table, &fields, row)?;
            feature.create(&layer)?;
        }
        Ok(())
    }

    fn write_vector(
        &self,
        dataset: &PointDataset,
        path: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, FocosError> {
        let stem = path
            .file_stem()
            .ok_or_else(|| FocosError::Export(format!("no file name in {path}")))?;
        for extension in LAYER_EXTENSIONS {
            remove_stale(&path.with_extension(extension.trim_start_matches('.')))?;
        }

        let srs = target_srs()?;
        {
            let driver = DriverManager::get_driver_by_name("ESRI Shapefile")?;
            let mut output = driver.create_vector_only(path.as_std_path())?;
            let layer = output.create_layer(LayerOptions {
                name: stem,
                srs: Some(&srs),
                ty: OGRwkbGeometryType::wkbPoint,
                options: Some(&["ENCODING=UTF-8"]),
            })?;
            let fields = define_fields(&layer, &dataset.table, Some(MAX_TEXT_WIDTH))?;
            for (row, point) in dataset.points.iter().enumerate() {
                let mut feature = Feature::new(layer.defn())?;
                fill_row(&mut feature, &dataset.table, &fields, row)?;
                feature.set_geometry(point_geometry(*point)?)?;
                feature.create(&layer)?;
            }
        }

        Ok(LAYER_EXTENSIONS
            .iter()
            .map(|extension| path.with_extension(extension.trim_start_matches('.')))
            .filter(|candidate| candidate.as_std_path().exists())
            .collect())
    }
}

fn remove_stale(path: &Utf8Path) -> Result<(), FocosError> {
    if path.as_std_path().exists() {
        fs::remove_file(path.as_std_path())
            .map_err(|err| FocosError::Export(format!("remove {path}: {err}")))?;
    }
    Ok(())
}

/// Field created for one column. `name` is what the driver actually assigned
/// (shapefile truncates to ten characters).
struct FieldSpec {
    name: String,
    kind: ColumnType,
    text_width: Option<usize>,
}

/// Creates one field per column. With `text_width` set, text fields get that
/// width instead of the driver default of 80.
fn define_fields<L: LayerAccess>(
    layer: &L,
    table: &Table,
    text_width: Option<usize>,
) -> Result<Vec<FieldSpec>, FocosError> {
    let mut kinds = Vec::new();
    for name in table.column_names() {
        let kind = table.column_type(&name).unwrap_or(ColumnType::Text);
        let field_type = match kind {
            ColumnType::Int => OGRFieldType::OFTInteger64,
            ColumnType::Float => OGRFieldType::OFTReal,
            ColumnType::Text => OGRFieldType::OFTString,
        };
        let definition = FieldDefn::new(&name, field_type)?;
        if let (ColumnType::Text, Some(width)) = (kind, text_width) {
            definition.set_width(width as i32);
        }
        definition.add_to_layer(layer)?;
        kinds.push(kind);
    }

    let assigned: Vec<String> = layer.defn().fields().map(|field| field.name()).collect();
    if assigned.len() != kinds.len() {
        return Err(FocosError::Export(format!(
            "driver created {} fields for {} columns",
            assigned.len(),
            kinds.len()
        )));
    }
    Ok(assigned
        .into_iter()
        .zip(kinds)
        .map(|(name, kind)| FieldSpec {
            name,
            kind,
            text_width: text_width.filter(|_| kind == ColumnType::Text),
        })
        .collect())
}

fn fill_row(
    feature: &mut Feature<'_>,
    table: &Table,
    fields: &[FieldSpec],
    row: usize,
) -> Result<(), FocosError> {
    for ((_, values), field) in table.columns().zip(fields) {
        let Some(value) = values.get(row).and_then(|value| field_value(field.kind, value)) else {
            continue;
        };
        if let (FieldValue::StringValue(text), Some(width)) = (&value, field.text_width)
            && text.len() > width
        {
            warn!(
                field = %field.name,
                row,
                bytes = text.len(),
                width,
                "text value will be truncated"
            );
        }
        feature.set_field(&field.name, &value)?;
    }
    Ok(())
}

fn field_value(kind: ColumnType, value: &Value) -> Option<FieldValue> {
    match (kind, value) {
        (_, Value::Null) => None,
        (ColumnType::Int, Value::Int(int)) => Some(FieldValue::Integer64Value(*int)),
        (ColumnType::Float, Value::Int(int)) => Some(FieldValue::RealValue(*int as f64)),
        (ColumnType::Float, Value::Float(float)) => Some(FieldValue::RealValue(*float)),
        (_, other) => other.as_text().map(FieldValue::StringValue),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StableAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishReport {
    pub local_workbook: Option<Utf8PathBuf>,
    pub local_vector: Vec<Utf8PathBuf>,
    pub stable_id: Option<String>,
    pub stable_action: Option<StableAction>,
    pub backups_uploaded: Vec<String>,
    pub backups_deleted: Vec<String>,
    pub descriptor: Option<Utf8PathBuf>,
}

/// Document read by the external presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct Descriptor {
    pub public_url: String,
    pub file_id: String,
    pub filename: String,
    pub last_updated: String,
    pub total_records: usize,
    pub description: String,
    pub source: String,
    pub processor: String,
    pub columns: Vec<String>,
    pub geographic_bounds: Bounds,
}

pub struct Publisher<'a, S: RemoteStore + ?Sized, W: ExportWriter + ?Sized> {
    store: &'a S,
    writer: &'a W,
    settings: &'a RunSettings,
}

impl<'a, S: RemoteStore + ?Sized, W: ExportWriter + ?Sized> Publisher<'a, S, W> {
    pub fn new(store: &'a S, writer: &'a W, settings: &'a RunSettings) -> Self {
        Self {
            store,
            writer,
            settings,
        }
    }

    /// Writes both exports under `workdir` and publishes them to the results
    /// folder: the stable workbook in place, a timestamped backup set, then
    /// retention, public access and the descriptor. Only a failed workbook and
    /// a failed stable upload are errors; a failed vector export is reported.
    pub fn publish(
        &self,
        dataset: &PointDataset,
        results_folder: Option<&str>,
        workdir: &Utf8Path,
        now: DateTime<Local>,
    ) -> Result<Staged<PublishReport>, FocosError> {
        ensure_dir(workdir)?;
        let mut degradations = Vec::new();
        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        let backup_stem = format!("{}{stamp}", self.settings.backup_prefix);

        let stable_path = workdir.join(&self.settings.stable_workbook);
        self.writer.write_workbook(&dataset.table, &stable_path)?;
        let backup_workbook = workdir.join(format!("{backup_stem}.xlsx"));
        fs::copy(stable_path.as_std_path(), backup_workbook.as_std_path())
            .map_err(|err| FocosError::Export(format!("copy {backup_workbook}: {err}")))?;
        let vector_path = workdir.join(format!("{backup_stem}.shp"));
        let vector_parts = match self.writer.write_vector(dataset, &vector_path) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(error = %err, "vector export failed, publishing the workbook only");
                degradations.push(Degradation::for_item(
                    Stage::Export,
                    vector_path.as_str(),
                    format!("vector export failed: {err}"),
                ));
                Vec::new()
            }
        };
        info!(
            rows = dataset.len(),
            columns = dataset.table.column_names().len(),
            "exports written"
        );

        let mut report = PublishReport {
            local_workbook: Some(stable_path.clone()),
            local_vector: vector_parts.clone(),
            ..Default::default()
        };

        let Some(folder) = results_folder else {
            warn!("results folder unresolved, exports not uploaded");
            degradations.push(Degradation::new(
                Stage::Publish,
                "results folder unresolved; exports were written locally only",
            ));
            return Ok(Staged::with(report, degradations));
        };

        let (stable_id, action) = self.publish_stable(folder, &stable_path)?;
        report.stable_id = Some(stable_id.clone());
        report.stable_action = Some(action);

        let mut backup_files = vec![backup_workbook];
        backup_files.extend(vector_parts);
        for path in &backup_files {
            let Some(name) = path.file_name() else {
                continue;
            };
            match self.store.upload(folder, name, path.as_std_path()) {
                Ok(_) => report.backups_uploaded.push(name.to_string()),
                Err(err) => {
                    warn!(file = %name, error = %err, "backup upload failed");
                    degradations.push(Degradation::for_item(
                        Stage::Publish,
                        name,
                        format!("backup upload failed: {err}"),
                    ));
                }
            }
        }

        match self.prune_backups(folder) {
            Ok(pruned) => {
                report.backups_deleted = pruned.value.clone();
                degradations.extend(pruned.degradations);
            }
            Err(err) => {
                warn!(error = %err, "backup cleanup failed");
                degradations.push(Degradation::new(
                    Stage::Publish,
                    format!("backup cleanup failed: {err}"),
                ));
            }
        }

        if let Err(err) = self.store.grant_public_read(&stable_id) {
            warn!(error = %err, "public permission grant failed");
            degradations.push(Degradation::for_item(
                Stage::Publish,
                &self.settings.stable_workbook,
                format!("public read grant failed: {err}"),
            ));
        }

        let descriptor = self.descriptor(dataset, &stable_id, now);
        match write_json_atomic(&self.settings.descriptor_path, &descriptor) {
            Ok(()) => report.descriptor = Some(self.settings.descriptor_path.clone()),
            Err(err) => degradations.push(Degradation::new(
                Stage::Publish,
                format!("descriptor not written: {err}"),
            )),
        }

        Ok(Staged::with(report, degradations))
    }

    /// Replaces the content of the stable workbook if one already exists under
    /// its fixed name, keeping its identifier; creates it otherwise.
    fn publish_stable(
        &self,
        folder: &str,
        local: &Utf8Path,
    ) -> Result<(String, StableAction), FocosError> {
        let name = &self.settings.stable_workbook;
        let existing = self
            .store
            .list(Some(folder), Some(name), Some(ResourceKind::File))?
            .into_iter()
            .find(|resource| &resource.name == name);

        match existing {
            Some(resource) => {
                let id = self.store.update_content(&resource.id, local.as_std_path())?;
                info!(file = %name, %id, "stable workbook updated in place");
                Ok((id, StableAction::Updated))
            }
            None => {
                let id = self.store.upload(folder, name, local.as_std_path())?;
                info!(file = %name, %id, "stable workbook created");
                Ok((id, StableAction::Created))
            }
        }
    }

    /// Keeps the newest `backup_depth` backup generations (files sharing one
    /// timestamp stem) and deletes the rest.
    pub fn prune_backups(&self, folder: &str) -> Result<Staged<Vec<String>>, FocosError> {
        let listing = self.store.list(
            Some(folder),
            Some(&self.settings.backup_prefix),
            Some(ResourceKind::File),
        )?;
        let generations = group_backups(&self.settings.backup_prefix, listing)?;

        let mut deleted = Vec::new();
        let mut degradations = Vec::new();
        for (stamp, files) in generations.into_iter().skip(self.settings.backup_depth) {
            info!(%stamp, files = files.len(), "removing old backup");
            for file in files {
                match self.store.delete(&file.id) {
                    Ok(()) => deleted.push(file.name),
                    Err(err) => degradations.push(Degradation::for_item(
                        Stage::Publish,
                        &file.name,
                        format!("old backup not deleted: {err}"),
                    )),
                }
            }
        }
        Ok(Staged::with(deleted, degradations))
    }

    fn descriptor(&self, dataset: &PointDataset, file_id: &str, now: DateTime<Local>) -> Descriptor {
        Descriptor {
            public_url: public_download_url(file_id),
            file_id: file_id.to_string(),
            filename: self.settings.stable_workbook.clone(),
            last_updated: now.to_rfc3339(),
            total_records: dataset.len(),
            description: self.settings.description.clone(),
            source: self.settings.source.clone(),
            processor: self.settings.processor.clone(),
            columns: dataset.table.column_names(),
            // Consolidation rejects datasets without rows, so bounds are always present.
            geographic_bounds: dataset.bounds().unwrap_or_default(),
        }
    }
}

/// Groups backup files by timestamp stem, newest generation first. The stable
/// workbook and unrelated names do not match the pattern.
pub fn group_backups(
    prefix: &str,
    files: Vec<RemoteResource>,
) -> Result<Vec<(String, Vec<RemoteResource>)>, FocosError> {
    let pattern = Regex::new(&format!(r"^{}(\d{{8}}_\d{{6}})\.", regex::escape(prefix)))
        .map_err(|err| FocosError::Export(err.to_string()))?;

    let mut groups: IndexMap<String, Vec<RemoteResource>> = IndexMap::new();
    for file in files {
        let Some(stamp) = pattern
            .captures(&file.name)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
        else {
            continue;
        };
        groups.entry(stamp).or_default().push(file);
    }

    let newest = |files: &[RemoteResource]| -> Option<DateTime<Utc>> {
        files.iter().filter_map(|file| file.created_at).max()
    };
    let mut ordered: Vec<(String, Vec<RemoteResource>)> = groups.into_iter().collect();
    ordered.sort_by(|(stamp_a, files_a), (stamp_b, files_b)| {
        newest(files_b)
            .cmp(&newest(files_a))
            .then_with(|| stamp_b.cmp(stamp_a))
    });
    Ok(ordered)
}
