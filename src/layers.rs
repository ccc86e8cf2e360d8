use gdal::Dataset;
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::vector::{FieldValue, Geometry, LayerAccess};
use indexmap::IndexMap;
use tracing::{debug, info};

use crate::consolidate::{Bounds, Coordinate, TARGET_EPSG};
use crate::domain::{Category, StagedLayer};
use crate::error::FocosError;
use crate::table::Value;

const TARGET_DEFINITION: &str = "OGC:CRS84";

/// Feature as read from disk, before reprojection and projection.
pub struct RawFeature {
    pub geometry: Option<Geometry>,
    pub attributes: IndexMap<String, Value>,
}

/// Vector layer as read from disk, in its native coordinate system.
pub struct RawLayer {
    pub srs: Option<SpatialRef>,
    pub fields: Vec<String>,
    pub features: Vec<RawFeature>,
}

/// Reads a staged vector layer. The GDAL loader is the real one; tests swap
/// in loaders that build geometry from WKT.
pub trait LayerLoader {
    fn load(&self, layer: &StagedLayer) -> Result<RawLayer, FocosError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GdalLayerLoader;

impl LayerLoader for GdalLayerLoader {
    fn load(&self, layer: &StagedLayer) -> Result<RawLayer, FocosError> {
        let path = layer.main_path().ok_or_else(|| {
            FocosError::Spatial(format!("layer {} has no geometry part", layer.base_name))
        })?;
        let dataset = Dataset::open(path.as_std_path())?;
        let mut source = dataset.layer(0)?;

        let srs = source.spatial_ref();
        let fields: Vec<String> = source.defn().fields().map(|field| field.name()).collect();

        let mut features = Vec::new();
        for feature in source.features() {
            let mut attributes = IndexMap::new();
            for name in &fields {
                let value = feature.field(name)?;
                attributes.insert(name.clone(), field_to_value(value));
            }
            features.push(RawFeature {
                geometry: feature.geometry().cloned(),
                attributes,
            });
        }
        debug!(layer = %layer.base_name, features = features.len(), "read vector layer");

        Ok(RawLayer {
            srs,
            fields,
            features,
        })
    }
}

fn field_to_value(value: Option<FieldValue>) -> Value {
    match value {
        None => Value::Null,
        Some(FieldValue::IntegerValue(value)) => Value::Int(i64::from(value)),
        Some(FieldValue::Integer64Value(value)) => Value::Int(value),
        Some(FieldValue::RealValue(value)) => Value::Float(value),
        Some(FieldValue::StringValue(value)) => Value::Text(value),
        Some(other) => other.into_string().map_or(Value::Null, Value::Text),
    }
}

/// WGS84 (EPSG:4326 datum) with longitude first, so x is always longitude.
pub fn target_srs() -> Result<SpatialRef, FocosError> {
    Ok(SpatialRef::from_definition(TARGET_DEFINITION)?)
}

pub fn point_geometry(point: Coordinate) -> Result<Geometry, FocosError> {
    Ok(Geometry::from_wkt(&format!("POINT ({} {})", point.lon, point.lat))?)
}

pub struct ReferenceFeature {
    pub geometry: Geometry,
    pub bounds: Bounds,
    /// One value per entry of `ReferenceLayer::columns`.
    pub attributes: Vec<Value>,
}

/// A reference layer in the target coordinate system, reduced to the label
/// columns of its category.
pub struct ReferenceLayer {
    pub category: Category,
    pub columns: Vec<String>,
    pub features: Vec<ReferenceFeature>,
}

impl ReferenceLayer {
    pub fn prepare(category: Category, raw: RawLayer) -> Result<Self, FocosError> {
        let columns = select_label_columns(category, &raw.fields);
        if columns.is_empty() {
            return Err(FocosError::Spatial(format!(
                "no label column among {:?} (expected one of {:?})",
                raw.fields,
                category.label_columns()
            )));
        }

        let target = target_srs()?;
        let transform = match raw.srs {
            Some(source) if source != target => {
                info!(%category, "reprojecting layer to EPSG:{TARGET_EPSG}");
                Some(CoordTransform::new(&source, &target)?)
            }
            _ => None,
        };

        let mut features = Vec::with_capacity(raw.features.len());
        for mut feature in raw.features {
            let Some(mut geometry) = feature.geometry.take() else {
                continue;
            };
            if let Some(transform) = &transform {
                geometry.transform_inplace(transform)?;
            }
            let envelope = geometry.envelope();
            let attributes = columns
                .iter()
                .map(|name| {
                    feature
                        .attributes
                        .shift_remove(name)
                        .unwrap_or(Value::Null)
                })
                .collect();
            features.push(ReferenceFeature {
                geometry,
                bounds: Bounds {
                    north: envelope.MaxY,
                    south: envelope.MinY,
                    east: envelope.MaxX,
                    west: envelope.MinX,
                },
                attributes,
            });
        }

        Ok(Self {
            category,
            columns,
            features,
        })
    }

    /// Index of the first feature containing `point`, if any.
    pub fn locate(&self, coordinate: Coordinate, point: &Geometry) -> Option<usize> {
        self.features
            .iter()
            .position(|feature| feature.covers(coordinate, point))
    }
}

impl ReferenceFeature {
    pub fn covers(&self, coordinate: Coordinate, point: &Geometry) -> bool {
        self.bounds.contains(coordinate) && self.geometry.contains(point)
    }
}

/// Allow-listed label columns present in `fields`, matched without regard to
/// case, in the layer's own spelling and order of the allow-list.
pub fn select_label_columns(category: Category, fields: &[String]) -> Vec<String> {
    let mut selected = Vec::new();
    for wanted in category.label_columns() {
        if let Some(found) = fields
            .iter()
            .find(|field| field.eq_ignore_ascii_case(wanted))
        {
            if !selected.contains(found) {
                selected.push(found.clone());
            }
        }
    }
    selected
}
