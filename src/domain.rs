use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FocosError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Folder,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResource {
    pub id: String,
    pub name: String,
    pub parent: Option<String>,
    pub size: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub kind: ResourceKind,
}

impl RemoteResource {
    pub fn is_folder(&self) -> bool {
        self.kind == ResourceKind::Folder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Observations,
    References,
    Results,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Observations, Role::References, Role::Results];

    /// Folder name that resolves this role without any fuzzy matching.
    pub fn canonical_label(&self) -> &'static str {
        match self {
            Role::Observations => "1. Focos",
            Role::References => "2. Referências Espaciais",
            Role::Results => "3. Resultados",
        }
    }

    /// Lower-case substrings accepted when no folder carries the canonical label.
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Role::Observations => &["focos"],
            Role::References => &["referências", "referencias"],
            Role::Results => &["resultados"],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Observations => write!(f, "observations"),
            Role::References => write!(f, "references"),
            Role::Results => write!(f, "results"),
        }
    }
}

/// Folders backing each role for one run. Built once by the resolver and
/// never changed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoleMap {
    observations: Option<RemoteResource>,
    references: Option<RemoteResource>,
    results: Option<RemoteResource>,
}

impl RoleMap {
    pub(crate) fn from_slots(
        observations: Option<RemoteResource>,
        references: Option<RemoteResource>,
        results: Option<RemoteResource>,
    ) -> Self {
        Self {
            observations,
            references,
            results,
        }
    }

    pub fn folder(&self, role: Role) -> Option<&RemoteResource> {
        match role {
            Role::Observations => self.observations.as_ref(),
            Role::References => self.references.as_ref(),
            Role::Results => self.results.as_ref(),
        }
    }

    pub fn id(&self, role: Role) -> Option<&str> {
        self.folder(role).map(|folder| folder.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Tabular,
    VectorPart { base: String, extension: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: Utf8PathBuf,
    pub remote_name: String,
    pub kind: FileKind,
}

/// A multi-part vector layer whose essential parts were all staged locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedLayer {
    pub base_name: String,
    pub folder_name: String,
    pub parts: Vec<StagedFile>,
}

impl StagedLayer {
    /// Path of the geometry component, the one GDAL opens.
    pub fn main_path(&self) -> Option<&Utf8PathBuf> {
        self.parts.iter().find_map(|part| match &part.kind {
            FileKind::VectorPart { extension, .. } if extension.eq_ignore_ascii_case(".shp") => {
                Some(&part.path)
            }
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Uf,
    Municipios,
    Biomas,
    TerrasIndigenas,
    UsoSolo,
    Zee,
    Ucs,
}

impl Category {
    /// Join order; conservation units always come last.
    pub const ORDERED: [Category; 7] = [
        Category::Uf,
        Category::Municipios,
        Category::Biomas,
        Category::TerrasIndigenas,
        Category::UsoSolo,
        Category::Zee,
        Category::Ucs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Uf => "uf",
            Category::Municipios => "municipios",
            Category::Biomas => "biomas",
            Category::TerrasIndigenas => "terras_indigenas",
            Category::UsoSolo => "uso_solo",
            Category::Zee => "zee",
            Category::Ucs => "ucs",
        }
    }

    pub fn synonyms(&self) -> &'static [&'static str] {
        match self {
            Category::Uf => &["unidades da federação", "unidades da federacao", "uf", "estados"],
            Category::Municipios => &["municipios", "municípios", "municipio"],
            Category::Biomas => &["biomas", "bioma", "lm_bioma"],
            Category::TerrasIndigenas => &[
                "terras indigenas",
                "terras indígenas",
                "terra indigena",
                "terras_indigenas",
            ],
            Category::UsoSolo => &["uso_solo", "uso do solo", "dissolve", "cobertura"],
            Category::Zee => &["zee", "zonas", "zoneamento"],
            Category::Ucs => &["unidades de conservação", "unidades de conservacao", "ucs"],
        }
    }

    /// Attribute columns carrying the meaningful label for this category.
    pub fn label_columns(&self) -> &'static [&'static str] {
        match self {
            Category::Uf => &["NM_UF", "SIGLA_UF", "SIGLA", "NOME_UF"],
            Category::Municipios => &["NM_MUN", "CD_MUN", "NOME_MUNI", "NM_MUNICIP"],
            Category::Biomas => &["Bioma", "NOM_BIOMA", "NM_BIOMA"],
            Category::TerrasIndigenas => &["terrai_nom", "etnia_nome", "NOME_TI", "fase_ti"],
            Category::UsoSolo => &["CLASSE", "classe_uso", "USO", "DN"],
            Category::Zee => &["ZONA", "SUBZONA", "NOME_ZONA"],
            Category::Ucs => &["NOME_UC1", "NOME_UC", "nome_uc", "NOME"],
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Category {
    type Err = FocosError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Category::ORDERED
            .into_iter()
            .find(|category| category.as_str() == value.trim())
            .ok_or_else(|| FocosError::Spatial(format!("unknown reference category: {value}")))
    }
}
