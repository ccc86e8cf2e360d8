use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::FocosError;

pub const TOKEN_ENV: &str = "FOCOS_ACCESS_TOKEN";
pub const DEFAULT_CREDENTIALS: &str = "credentials.json";

/// Credential descriptor granting the remote store client access.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Credentials {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub upload_base: Option<String>,
}

impl Credentials {
    /// Bearer token, preferring the environment over the file.
    pub fn bearer_token(&self) -> Result<String, FocosError> {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.trim().is_empty() {
                return Ok(token.trim().to_string());
            }
        }
        self.access_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or(FocosError::MissingCredentials)
    }
}

/// Fixed pipeline constants. Not exposed on the command line.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub stable_workbook: String,
    pub backup_prefix: String,
    pub backup_depth: usize,
    pub descriptor_path: Utf8PathBuf,
    /// Where the stable workbook and the backup set are written locally.
    /// Survives the run, unlike the staging directory.
    pub output_dir: Utf8PathBuf,
    pub staging_parent: Option<PathBuf>,
    pub description: String,
    pub source: String,
    pub processor: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            stable_workbook: "focos_qualificados_atual.xlsx".to_string(),
            backup_prefix: "focos_qualificados_".to_string(),
            backup_depth: 5,
            descriptor_path: Utf8PathBuf::from("data/current_data_link.json"),
            output_dir: Utf8PathBuf::from("data"),
            staging_parent: None,
            description: "Dados de focos de calor do Maranhão processados automaticamente"
                .to_string(),
            source: "INPE".to_string(),
            processor: "IMESC".to_string(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the credential descriptor. A missing default file is tolerated
    /// so the token can come from the environment alone.
    pub fn resolve(path: Option<&str>) -> Result<Credentials, FocosError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CREDENTIALS),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(Credentials::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| FocosError::ConfigRead(config_path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Credentials, FocosError> {
        serde_json::from_str(content).map_err(|err| FocosError::ConfigParse(err.to_string()))
    }
}
