use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::BufWriter;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::domain::{FileKind, RemoteResource, ResourceKind, StagedFile, StagedLayer};
use crate::error::{Degradation, FocosError, Stage, Staged};
use crate::fs_util::{ensure_dir, safe_file_name};
use crate::remote::RemoteStore;

/// Shapefile components in download order.
pub const LAYER_EXTENSIONS: [&str; 7] = [".shp", ".shx", ".dbf", ".prj", ".cpg", ".sbn", ".sbx"];
/// Geometry, index and attribute table; a layer is unreadable without them.
pub const ESSENTIAL_EXTENSIONS: [&str; 3] = [".shp", ".shx", ".dbf"];

pub struct BatchFetcher<'a, S: RemoteStore + ?Sized> {
    store: &'a S,
    staging: &'a Utf8Path,
}

impl<'a, S: RemoteStore + ?Sized> BatchFetcher<'a, S> {
    pub fn new(store: &'a S, staging: &'a Utf8Path) -> Self {
        Self { store, staging }
    }

    /// Downloads every file in `folder_id` whose name contains `extension`.
    /// A failed item is reported and left out; only the listing itself can fail.
    pub fn fetch_tabular(
        &self,
        folder_id: &str,
        extension: &str,
    ) -> Result<Staged<Vec<StagedFile>>, FocosError> {
        let listing = self
            .store
            .list(Some(folder_id), Some(extension), Some(ResourceKind::File))?;
        let target_dir = self.staging.join("tabular");
        ensure_dir(&target_dir)?;

        let mut staged = Vec::new();
        let mut degradations = Vec::new();
        for (index, resource) in listing.iter().enumerate() {
            let local = target_dir.join(format!("{index:03}_{}", safe_file_name(&resource.name)));
            match self.download_to(resource, &local) {
                Ok(bytes) => {
                    debug!(file = %resource.name, bytes, "staged tabular file");
                    staged.push(StagedFile {
                        path: local,
                        remote_name: resource.name.clone(),
                        kind: FileKind::Tabular,
                    });
                }
                Err(err) => {
                    warn!(file = %resource.name, error = %err, "download failed");
                    degradations.push(Degradation::for_item(
                        Stage::Fetch,
                        &resource.name,
                        err.to_string(),
                    ));
                }
            }
        }
        info!(listed = listing.len(), staged = staged.len(), "fetched tabular files");
        Ok(Staged::with(staged, degradations))
    }

    /// Finds every `.shp` under the references folder (and its sub-folders)
    /// and stages each complete layer. `folder` is the references folder itself.
    pub fn fetch_vector_layers(
        &self,
        folder: &RemoteResource,
    ) -> Result<Staged<Vec<StagedLayer>>, FocosError> {
        let mut degradations = Vec::new();
        let anchors = self.find_layer_anchors(folder, &mut degradations)?;

        let mut layers = Vec::new();
        for (index, (anchor, folder_name)) in anchors.into_iter().enumerate() {
            match self.fetch_layer(index, &anchor, &folder_name) {
                Ok(layer) => layers.push(layer.drain_into(&mut degradations)),
                Err(degradation) => {
                    warn!(layer = %anchor.name, reason = %degradation.reason, "layer excluded");
                    degradations.push(degradation);
                }
            }
        }
        info!(layers = layers.len(), "fetched reference layers");
        Ok(Staged::with(layers, degradations))
    }

    fn find_layer_anchors(
        &self,
        root: &RemoteResource,
        degradations: &mut Vec<Degradation>,
    ) -> Result<Vec<(RemoteResource, String)>, FocosError> {
        let mut anchors = Vec::new();
        let mut queue = VecDeque::from([root.clone()]);
        let mut is_root = true;
        while let Some(folder) = queue.pop_front() {
            let children = match self.store.list(Some(&folder.id), None, None) {
                Ok(children) => children,
                // The root listing failing means there is nothing to work with.
                Err(err) if is_root => return Err(err),
                Err(err) => {
                    degradations.push(Degradation::for_item(
                        Stage::Fetch,
                        &folder.name,
                        format!("cannot list sub-folder: {err}"),
                    ));
                    continue;
                }
            };
            is_root = false;
            for child in children {
                if child.is_folder() {
                    queue.push_back(child);
                } else if split_layer_name(&child.name)
                    .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(".shp"))
                {
                    anchors.push((child, folder.name.clone()));
                }
            }
        }
        Ok(anchors)
    }

    /// Stages every sibling part of `anchor`. Missing or failed essential parts
    /// exclude the layer; optional parts are best effort.
    pub fn fetch_layer(
        &self,
        index: usize,
        anchor: &RemoteResource,
        folder_name: &str,
    ) -> Result<Staged<StagedLayer>, Degradation> {
        let excluded = |reason: String| Degradation::for_item(Stage::Fetch, &anchor.name, reason);
        let (base, _) = split_layer_name(&anchor.name)
            .ok_or_else(|| excluded("not a shapefile component".to_string()))?;
        let parent = anchor
            .parent
            .as_deref()
            .ok_or_else(|| excluded("layer has no parent folder".to_string()))?;

        let layer_dir = self
            .staging
            .join("spatial_ref")
            .join(format!("{index:03}_{}", safe_file_name(base)));
        ensure_dir(&layer_dir).map_err(|err| excluded(err.to_string()))?;

        let mut parts = Vec::new();
        let mut degradations = Vec::new();
        for extension in LAYER_EXTENSIONS {
            let essential = ESSENTIAL_EXTENSIONS.contains(&extension);
            let wanted = format!("{base}{extension}");
            let candidate = match self.find_sibling(parent, &wanted) {
                Ok(candidate) => candidate,
                Err(err) if essential => {
                    return Err(excluded(format!("cannot list {wanted}: {err}")));
                }
                Err(err) => {
                    degradations.push(Degradation::for_item(
                        Stage::Fetch,
                        &wanted,
                        format!("optional part not listed: {err}"),
                    ));
                    continue;
                }
            };
            let Some(resource) = candidate else {
                if essential {
                    return Err(excluded(format!("essential part {wanted} is missing")));
                }
                continue;
            };

            // Local parts share one spelling so the driver finds its siblings.
            let local = layer_dir.join(safe_file_name(&wanted));
            match self.download_to(&resource, &local) {
                Ok(_) => parts.push(StagedFile {
                    path: local,
                    remote_name: resource.name.clone(),
                    kind: FileKind::VectorPart {
                        base: base.to_string(),
                        extension: extension.to_string(),
                    },
                }),
                Err(err) if essential => {
                    return Err(excluded(format!("essential part {wanted} failed: {err}")));
                }
                Err(err) => {
                    warn!(file = %wanted, error = %err, "optional layer part skipped");
                    degradations.push(Degradation::for_item(
                        Stage::Fetch,
                        &wanted,
                        err.to_string(),
                    ));
                }
            }
        }

        Ok(Staged::with(
            StagedLayer {
                base_name: base.to_string(),
                folder_name: folder_name.to_string(),
                parts,
            },
            degradations,
        ))
    }

    fn find_sibling(&self, parent: &str, wanted: &str) -> Result<Option<RemoteResource>, FocosError> {
        let listing = self
            .store
            .list(Some(parent), Some(wanted), Some(ResourceKind::File))?;
        Ok(listing
            .into_iter()
            .find(|resource| resource.name.eq_ignore_ascii_case(wanted)))
    }

    fn download_to(&self, resource: &RemoteResource, local: &Utf8PathBuf) -> Result<u64, FocosError> {
        let file = File::create(local.as_std_path())
            .map_err(|err| FocosError::Filesystem(format!("create {local}: {err}")))?;
        let mut writer = BufWriter::new(file);
        let result = self.store.download(&resource.id, &mut writer).and_then(|bytes| {
            writer
                .into_inner()
                .map_err(|err| FocosError::Filesystem(err.to_string()))?;
            Ok(bytes)
        });
        if result.is_err() {
            let _ = fs::remove_file(local.as_std_path());
        }
        result
    }
}

/// Splits `name` into base and the known layer extension it ends with.
pub fn split_layer_name(name: &str) -> Option<(&str, &str)> {
    let dot = name.rfind('.')?;
    let (base, ext) = name.split_at(dot);
    if base.is_empty() {
        return None;
    }
    LAYER_EXTENSIONS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(ext))
        .then_some((base, ext))
}
