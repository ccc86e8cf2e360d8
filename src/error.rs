use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FocosError {
    #[error("observations folder not found among the folders visible to this account")]
    #[diagnostic(help(
        "share the folders with the service account and check that one is named \"1. Focos\" or contains \"focos\""
    ))]
    ObservationsFolderMissing,

    #[error("no tabular files could be retrieved from the observations folder")]
    NoTabularFiles,

    #[error("no valid rows left after consolidating the observation files")]
    NoValidRows,

    #[error("coordinate column missing from consolidated observations: {0}")]
    MissingCoordinateColumns(String),

    #[error("missing access token: set FOCOS_ACCESS_TOKEN or access_token in the credential file")]
    MissingCredentials,

    #[error("failed to read credential file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse credential file: {0}")]
    ConfigParse(String),

    #[error("remote store request failed: {0}")]
    RemoteHttp(String),

    #[error("remote store returned status {status}: {message}")]
    RemoteStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to parse tabular file {file}: {message}")]
    TabularParse { file: String, message: String },

    #[error("spatial operation failed: {0}")]
    Spatial(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("table shape mismatch: {0}")]
    TableShape(String),
}

impl FocosError {
    /// Preconditions that abort a run before anything is published.
    pub fn is_fatal_precondition(&self) -> bool {
        matches!(
            self,
            FocosError::ObservationsFolderMissing
                | FocosError::NoTabularFiles
                | FocosError::NoValidRows
                | FocosError::MissingCoordinateColumns(_)
        )
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            FocosError::RemoteHttp(_) | FocosError::RemoteStatus { .. }
        )
    }
}

impl From<gdal::errors::GdalError> for FocosError {
    fn from(err: gdal::errors::GdalError) -> Self {
        FocosError::Spatial(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolve,
    Fetch,
    Consolidate,
    Classify,
    Join,
    Export,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolve => "Resolve",
            Stage::Fetch => "Fetch",
            Stage::Consolidate => "Consolidate",
            Stage::Classify => "Classify",
            Stage::Join => "Join",
            Stage::Export => "Export",
            Stage::Publish => "Publish",
        };
        write!(f, "{name}")
    }
}

/// A condition that reduced the run's output without aborting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Degradation {
    pub stage: Stage,
    pub item: Option<String>,
    pub reason: String,
}

impl Degradation {
    pub fn new(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            item: None,
            reason: reason.into(),
        }
    }

    pub fn for_item(stage: Stage, item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage,
            item: Some(item.into()),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.item {
            Some(item) => write!(f, "[{}] {}: {}", self.stage, item, self.reason),
            None => write!(f, "[{}] {}", self.stage, self.reason),
        }
    }
}

/// Value produced by a stage together with everything it had to give up on.
#[derive(Debug, Clone)]
pub struct Staged<T> {
    pub value: T,
    pub degradations: Vec<Degradation>,
}

impl<T> Staged<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            degradations: Vec::new(),
        }
    }

    pub fn with(value: T, degradations: Vec<Degradation>) -> Self {
        Self {
            value,
            degradations,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    /// Moves the degradations into `sink` and returns the bare value.
    pub fn drain_into(self, sink: &mut Vec<Degradation>) -> T {
        sink.extend(self.degradations);
        self.value
    }
}
