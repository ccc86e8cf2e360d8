use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::classify::ReferenceClassifier;
use crate::config::RunSettings;
use crate::consolidate::{Consolidator, PointDataset};
use crate::domain::{Category, Role, RoleMap};
use crate::error::{Degradation, FocosError, Stage};
use crate::export::{ExportWriter, PublishReport, Publisher};
use crate::fetch::BatchFetcher;
use crate::join::{SpatialJoiner, enrich_with};
use crate::layers::LayerLoader;
use crate::remote::RemoteStore;
use crate::roles::RoleResolver;

pub const TABULAR_EXTENSION: &str = ".csv";

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Scratch space owned by one run. Dropping it removes every staged file,
/// whichever way the run ends.
pub struct RunContext {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl RunContext {
    pub fn new(settings: &RunSettings) -> Result<Self, FocosError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("focos-enrich");
        let dir = match &settings.staging_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|err| FocosError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|_| FocosError::Filesystem("non-utf8 staging path".to_string()))?;
        Ok(Self { _dir: dir, root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub roles: RoleMap,
    pub tabular_files: usize,
    pub records: usize,
    pub columns: Vec<String>,
    pub reference_layers: usize,
    pub categories: Vec<Category>,
    pub publish: PublishReport,
    pub degradations: Vec<Degradation>,
}

impl RunReport {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

pub struct Pipeline<S: RemoteStore, L: LayerLoader, W: ExportWriter> {
    store: S,
    loader: L,
    writer: W,
    settings: RunSettings,
}

impl<S: RemoteStore, L: LayerLoader, W: ExportWriter> Pipeline<S, L, W> {
    pub fn new(store: S, loader: L, writer: W, settings: RunSettings) -> Self {
        Self {
            store,
            loader,
            writer,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs every stage once. Fatal preconditions come back as errors;
    /// everything else is folded into the report's degradations.
    pub fn run(&self, sink: &dyn ProgressSink) -> Result<RunReport, FocosError> {
        let context = RunContext::new(&self.settings)?;
        let started = Instant::now();
        let mut degradations = Vec::new();

        emit(sink, "phase=Resolve; scanning folders", None);
        let folders = self.store.list_folders()?;
        let roles = RoleResolver::new().resolve(&folders);
        let Some(observations) = roles.folder(Role::Observations) else {
            return Err(FocosError::ObservationsFolderMissing);
        };

        emit(sink, &format!("phase=Fetch; {}", observations.name), None);
        let fetcher = BatchFetcher::new(&self.store, context.root());
        let tabular = fetcher
            .fetch_tabular(&observations.id, TABULAR_EXTENSION)?
            .drain_into(&mut degradations);
        if tabular.is_empty() {
            return Err(FocosError::NoTabularFiles);
        }

        emit(sink, &format!("phase=Consolidate; {} files", tabular.len()), None);
        let dataset = Consolidator::new()
            .consolidate(&tabular)?
            .drain_into(&mut degradations);
        info!(records = dataset.len(), "observations consolidated");

        let (dataset, categories) =
            self.enrich(dataset, &roles, &fetcher, sink, &mut degradations);

        emit(sink, "phase=Export; writing artifacts", None);
        let publisher = Publisher::new(&self.store, &self.writer, &self.settings);
        let publish = publisher
            .publish(
                &dataset,
                roles.id(Role::Results),
                &self.settings.output_dir,
                Local::now(),
            )?
            .drain_into(&mut degradations);

        for degradation in &degradations {
            warn!(%degradation, "run degraded");
        }
        emit(
            sink,
            &format!("phase=Publish; done, {} records", dataset.len()),
            Some(started.elapsed()),
        );

        Ok(RunReport {
            roles: roles.clone(),
            tabular_files: tabular.len(),
            records: dataset.len(),
            columns: dataset.table.column_names(),
            reference_layers: categories.len(),
            categories,
            publish,
            degradations,
        })
    }

    fn enrich(
        &self,
        dataset: PointDataset,
        roles: &RoleMap,
        fetcher: &BatchFetcher<'_, S>,
        sink: &dyn ProgressSink,
        degradations: &mut Vec<Degradation>,
    ) -> (PointDataset, Vec<Category>) {
        let Some(references) = roles.folder(Role::References) else {
            degradations.push(Degradation::new(
                Stage::Resolve,
                "references folder unresolved; points exported without enrichment",
            ));
            return (dataset, Vec::new());
        };

        emit(sink, &format!("phase=Fetch; {}", references.name), None);
        let staged = match fetcher.fetch_vector_layers(references) {
            Ok(staged) => staged.drain_into(degradations),
            Err(err) => {
                degradations.push(Degradation::for_item(
                    Stage::Fetch,
                    &references.name,
                    format!("reference layers unavailable: {err}"),
                ));
                return (dataset, Vec::new());
            }
        };

        emit(sink, &format!("phase=Classify; {} layers", staged.len()), None);
        let assigned = ReferenceClassifier::default()
            .assign(staged)
            .drain_into(degradations);

        emit(sink, &format!("phase=Join; {} categories", assigned.len()), None);
        let joiner = SpatialJoiner::new(&self.loader);
        let layers = joiner.load_layers(&assigned).drain_into(degradations);
        let categories = Category::ORDERED
            .into_iter()
            .filter(|category| layers.iter().any(|layer| layer.category == *category))
            .collect();
        let enriched = enrich_with(dataset, &layers).drain_into(degradations);
        (enriched, categories)
    }
}

fn emit(sink: &dyn ProgressSink, message: &str, elapsed: Option<Duration>) {
    sink.event(ProgressEvent {
        message: message.to_string(),
        elapsed,
    });
}
