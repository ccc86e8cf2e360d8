use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::json;

use crate::config::Credentials;
use crate::domain::{RemoteResource, ResourceKind};
use crate::error::FocosError;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const LIST_FIELDS: &str = "nextPageToken, files(id, name, parents, size, createdTime, mimeType)";

/// Generic remote object store grouped in parent/child folders.
pub trait RemoteStore {
    /// Every folder visible to the process, in listing order.
    fn list_folders(&self) -> Result<Vec<RemoteResource>, FocosError>;
    fn list(
        &self,
        parent: Option<&str>,
        name_contains: Option<&str>,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<RemoteResource>, FocosError>;
    fn download(&self, id: &str, sink: &mut dyn Write) -> Result<u64, FocosError>;
    fn upload(&self, parent: &str, name: &str, source: &Path) -> Result<String, FocosError>;
    fn update_content(&self, id: &str, source: &Path) -> Result<String, FocosError>;
    fn delete(&self, id: &str) -> Result<(), FocosError>;
    fn grant_public_read(&self, id: &str) -> Result<(), FocosError>;
}

pub fn public_download_url(id: &str) -> String {
    format!("https://drive.google.com/uc?id={id}&export=download")
}

#[derive(Clone)]
pub struct DriveHttpClient {
    client: Client,
    api_base: String,
    upload_base: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveId {
    id: String,
}

impl From<DriveFile> for RemoteResource {
    fn from(file: DriveFile) -> Self {
        let kind = if file.mime_type.as_deref() == Some(FOLDER_MIME) {
            ResourceKind::Folder
        } else {
            ResourceKind::File
        };
        RemoteResource {
            id: file.id,
            name: file.name,
            parent: file.parents.into_iter().next(),
            size: file.size.and_then(|size| size.parse().ok()),
            created_at: file.created_time,
            kind,
        }
    }
}

impl DriveHttpClient {
    pub fn new(credentials: &Credentials) -> Result<Self, FocosError> {
        let token = credentials.bearer_token()?;
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("focos-enrich/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| FocosError::RemoteHttp(err.to_string()))?,
        );
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| FocosError::RemoteHttp(err.to_string()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| FocosError::RemoteHttp(err.to_string()))?;

        Ok(Self {
            client,
            api_base: credentials
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            upload_base: credentials
                .upload_base
                .clone()
                .unwrap_or_else(|| DEFAULT_UPLOAD_BASE.to_string()),
        })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, FocosError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 250;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        std::thread::sleep(Duration::from_millis(
                            BASE_DELAY_MS * (attempt as u64 + 1),
                        ));
                        attempt += 1;
                        continue;
                    }
                    return Self::handle_status(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                        std::thread::sleep(Duration::from_millis(
                            BASE_DELAY_MS * (attempt as u64 + 1),
                        ));
                        attempt += 1;
                        continue;
                    }
                    return Err(FocosError::RemoteHttp(err.to_string()));
                }
            }
        }
    }

    fn handle_status(response: Response) -> Result<Response, FocosError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "remote store request failed".to_string());
        Err(FocosError::RemoteStatus { status, message })
    }

    fn query(&self, q: &str) -> Result<Vec<RemoteResource>, FocosError> {
        let url = format!("{}/files", self.api_base);
        let mut resources = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let response = self.send_with_retries(|| {
                let mut params = vec![
                    ("q", q.to_string()),
                    ("fields", LIST_FIELDS.to_string()),
                    ("pageSize", "1000".to_string()),
                    ("supportsAllDrives", "true".to_string()),
                    ("includeItemsFromAllDrives", "true".to_string()),
                ];
                if let Some(token) = &page_token {
                    params.push(("pageToken", token.clone()));
                }
                self.client.get(&url).query(&params)
            })?;
            let page: DriveFileList = response
                .json()
                .map_err(|err| FocosError::RemoteHttp(err.to_string()))?;
            resources.extend(page.files.into_iter().map(RemoteResource::from));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(resources)
    }

    fn put_media(&self, id: &str, source: &Path) -> Result<String, FocosError> {
        let bytes = fs::read(source)
            .map_err(|err| FocosError::Filesystem(format!("read {}: {err}", source.display())))?;
        let url = format!("{}/files/{id}", self.upload_base);
        let mime = media_type(source);
        let response = self.send_with_retries(|| {
            self.client
                .patch(&url)
                .query(&[("uploadType", "media"), ("supportsAllDrives", "true")])
                .header(CONTENT_TYPE, mime)
                .body(bytes.clone())
        })?;
        let body: DriveId = response
            .json()
            .map_err(|err| FocosError::RemoteHttp(err.to_string()))?;
        Ok(body.id)
    }
}

impl RemoteStore for DriveHttpClient {
    fn list_folders(&self) -> Result<Vec<RemoteResource>, FocosError> {
        self.query(&format!("mimeType='{FOLDER_MIME}' and trashed=false"))
    }

    fn list(
        &self,
        parent: Option<&str>,
        name_contains: Option<&str>,
        kind: Option<ResourceKind>,
    ) -> Result<Vec<RemoteResource>, FocosError> {
        self.query(&build_query(parent, name_contains, kind))
    }

    fn download(&self, id: &str, sink: &mut dyn Write) -> Result<u64, FocosError> {
        let url = format!("{}/files/{id}", self.api_base);
        let mut response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .query(&[("alt", "media"), ("supportsAllDrives", "true")])
        })?;
        response
            .copy_to(sink)
            .map_err(|err| FocosError::RemoteHttp(err.to_string()))
    }

    fn upload(&self, parent: &str, name: &str, source: &Path) -> Result<String, FocosError> {
        let url = format!("{}/files", self.api_base);
        let metadata = json!({ "name": name, "parents": [parent] });
        let response = self.send_with_retries(|| {
            self.client
                .post(&url)
                .query(&[("supportsAllDrives", "true")])
                .json(&metadata)
        })?;
        let created: DriveId = response
            .json()
            .map_err(|err| FocosError::RemoteHttp(err.to_string()))?;
        match self.put_media(&created.id, source) {
            Ok(id) => Ok(id),
            Err(err) => {
                // Do not leave an empty placeholder behind.
                let _ = self.delete(&created.id);
                Err(err)
            }
        }
    }

    fn update_content(&self, id: &str, source: &Path) -> Result<String, FocosError> {
        self.put_media(id, source)
    }

    fn delete(&self, id: &str) -> Result<(), FocosError> {
        let url = format!("{}/files/{id}", self.api_base);
        self.send_with_retries(|| {
            self.client
                .delete(&url)
                .query(&[("supportsAllDrives", "true")])
        })?;
        Ok(())
    }

    fn grant_public_read(&self, id: &str) -> Result<(), FocosError> {
        let url = format!("{}/files/{id}/permissions", self.api_base);
        let body = json!({ "role": "reader", "type": "anyone" });
        self.send_with_retries(|| {
            self.client
                .post(&url)
                .query(&[("supportsAllDrives", "true")])
                .json(&body)
        })?;
        Ok(())
    }
}

pub fn build_query(
    parent: Option<&str>,
    name_contains: Option<&str>,
    kind: Option<ResourceKind>,
) -> String {
    let mut clauses = Vec::new();
    if let Some(parent) = parent {
        clauses.push(format!("'{}' in parents", escape_literal(parent)));
    }
    if let Some(name) = name_contains {
        clauses.push(format!("name contains '{}'", escape_literal(name)));
    }
    match kind {
        Some(ResourceKind::Folder) => clauses.push(format!("mimeType='{FOLDER_MIME}'")),
        Some(ResourceKind::File) => clauses.push(format!("mimeType!='{FOLDER_MIME}'")),
        None => {}
    }
    clauses.push("trashed=false".to_string());
    clauses.join(" and ")
}

fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn media_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("prj") | Some("cpg") => "text/plain",
        _ => "application/octet-stream",
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}
