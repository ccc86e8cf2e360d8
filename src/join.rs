use gdal::vector::Geometry;
use indexmap::IndexMap;
use tracing::{info, warn};

use crate::consolidate::PointDataset;
use crate::domain::{Category, StagedLayer};
use crate::error::{Degradation, FocosError, Stage, Staged};
use crate::layers::{LayerLoader, ReferenceLayer, point_geometry};
use crate::table::{Table, Value};

/// Matched feature index written by each containment join. Removed before the
/// next join and once all joins are done.
pub const JOIN_INDEX_COLUMN: &str = "index_right";
pub const UCS_COLUMN: &str = "ucs";
pub const UCS_SEPARATOR: &str = ", ";

pub struct SpatialJoiner<'a, L: LayerLoader + ?Sized> {
    loader: &'a L,
}

impl<'a, L: LayerLoader + ?Sized> SpatialJoiner<'a, L> {
    pub fn new(loader: &'a L) -> Self {
        Self { loader }
    }

    /// Loads and prepares every classified layer. A layer that fails is left
    /// out with the reason recorded.
    pub fn load_layers(
        &self,
        references: &IndexMap<Category, StagedLayer>,
    ) -> Staged<Vec<ReferenceLayer>> {
        let mut layers = Vec::new();
        let mut degradations = Vec::new();
        for (category, staged) in references {
            let prepared = self
                .loader
                .load(staged)
                .and_then(|raw| ReferenceLayer::prepare(*category, raw));
            match prepared {
                Ok(layer) => {
                    info!(%category, features = layer.features.len(), "reference layer loaded");
                    layers.push(layer);
                }
                Err(err) => {
                    warn!(%category, error = %err, "reference layer skipped");
                    degradations.push(Degradation::for_item(
                        Stage::Join,
                        category.as_str(),
                        format!("cannot load {}: {err}", staged.base_name),
                    ));
                }
            }
        }
        Staged::with(layers, degradations)
    }
}

/// Applies every layer to `dataset` in the fixed category order. Never fails;
/// a layer that cannot be joined is skipped and reported.
pub fn enrich_with(mut dataset: PointDataset, layers: &[ReferenceLayer]) -> Staged<PointDataset> {
    let mut degradations = Vec::new();
    if layers.is_empty() {
        return Staged::clean(dataset);
    }

    let points = match dataset
        .points
        .iter()
        .map(|point| point_geometry(*point))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(points) => points,
        Err(err) => {
            degradations.push(Degradation::new(
                Stage::Join,
                format!("cannot build point geometries: {err}"),
            ));
            return Staged::with(dataset, degradations);
        }
    };

    for category in Category::ORDERED {
        let Some(layer) = layers.iter().find(|layer| layer.category == category) else {
            continue;
        };
        dataset.table.drop_column(JOIN_INDEX_COLUMN);
        let joined = if category == Category::Ucs {
            accumulate_ucs(&mut dataset, &points, layer)
        } else {
            join_layer(&mut dataset, &points, layer)
        };
        match joined {
            Ok(matched) => info!(%category, matched, "spatial join applied"),
            Err(err) => {
                warn!(%category, error = %err, "spatial join failed");
                degradations.push(Degradation::for_item(
                    Stage::Join,
                    category.as_str(),
                    err.to_string(),
                ));
            }
        }
    }
    dataset.table.drop_column(JOIN_INDEX_COLUMN);

    Staged::with(dataset, degradations)
}

/// Left point-in-polygon join: each point takes the attributes of the first
/// feature containing it, or nulls. Returns the number of matched points.
pub fn join_layer(
    dataset: &mut PointDataset,
    points: &[Geometry],
    layer: &ReferenceLayer,
) -> Result<usize, FocosError> {
    check_alignment(dataset, points)?;

    let matches: Vec<Option<usize>> = dataset
        .points
        .iter()
        .zip(points)
        .map(|(coordinate, point)| layer.locate(*coordinate, point))
        .collect();

    let mut new_columns = Vec::with_capacity(layer.columns.len() + 1);
    for (position, name) in layer.columns.iter().enumerate() {
        let values = matches
            .iter()
            .map(|hit| match hit {
                Some(index) => layer.features[*index].attributes[position].clone(),
                None => Value::Null,
            })
            .collect::<Vec<_>>();
        new_columns.push((output_name(&dataset.table, name, layer.category), values));
    }
    new_columns.push((
        JOIN_INDEX_COLUMN.to_string(),
        matches
            .iter()
            .map(|hit| hit.map_or(Value::Null, |index| Value::Int(index as i64)))
            .collect(),
    ));

    for (name, values) in new_columns {
        dataset.table.push_column(name, values)?;
    }
    Ok(matches.iter().filter(|hit| hit.is_some()).count())
}

/// Conservation units may overlap, so every unit containing a point adds its
/// name to one comma-separated column, in unit order.
pub fn accumulate_ucs(
    dataset: &mut PointDataset,
    points: &[Geometry],
    layer: &ReferenceLayer,
) -> Result<usize, FocosError> {
    check_alignment(dataset, points)?;

    let mut names = vec![String::new(); dataset.len()];
    for feature in &layer.features {
        let Some(unit) = feature.attributes.first().and_then(Value::as_text) else {
            continue;
        };
        for ((acc, coordinate), point) in names.iter_mut().zip(&dataset.points).zip(points) {
            if feature.covers(*coordinate, point) {
                acc.push_str(UCS_SEPARATOR);
                acc.push_str(&unit);
            }
        }
    }

    let matched = names.iter().filter(|name| !name.is_empty()).count();
    let values = names
        .into_iter()
        .map(|name| {
            let trimmed = name.strip_prefix(UCS_SEPARATOR).unwrap_or(&name).to_string();
            Value::Text(trimmed)
        })
        .collect();
    let column = output_name(&dataset.table, UCS_COLUMN, layer.category);
    dataset.table.push_column(column, values)?;
    Ok(matched)
}

fn check_alignment(dataset: &PointDataset, points: &[Geometry]) -> Result<(), FocosError> {
    if points.len() != dataset.len() || dataset.table.row_count() != dataset.len() {
        return Err(FocosError::TableShape(format!(
            "{} geometries for {} points and {} rows",
            points.len(),
            dataset.len(),
            dataset.table.row_count()
        )));
    }
    Ok(())
}

fn output_name(table: &Table, name: &str, category: Category) -> String {
    if table.has_column(name) {
        format!("{name}_{category}")
    } else {
        name.to_string()
    }
}
