use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

use crate::divergence::without_server_metadata;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHeader {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl ManifestHeader {
    pub fn from_body(body: &Value) -> Result<Self> {
        let field = |value: Option<&Value>, name: &str| -> Result<String> {
            value
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .with_context(|| format!("manifest has no {name}"))
        };
        let metadata = body.get("metadata");
        Ok(Self {
            api_version: field(body.get("apiVersion"), "apiVersion")?,
            kind: field(body.get("kind"), "kind")?,
            name: field(metadata.and_then(|meta| meta.get("name")), "metadata.name")?,
            namespace: metadata
                .and_then(|meta| meta.get("namespace"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ManifestFile {
    path: PathBuf,
    modified: Option<SystemTime>,
    contents: Option<String>,
}

impl ManifestFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            modified: None,
            contents: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub fn contents(&self) -> &str {
        self.contents.as_deref().unwrap_or_default()
    }

    pub fn load(&mut self) -> Result<Value> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read manifest {}", self.path.display()))?;
        let body = parse_manifest(&raw)
            .with_context(|| format!("failed to parse manifest {}", self.path.display()))?;
        self.remember(raw);
        Ok(body)
    }

    pub fn save(&mut self, body: &Value) -> Result<()> {
        let raw = render_manifest(body)?;
        fs::write(&self.path, &raw)
            .with_context(|| format!("failed to write manifest {}", self.path.display()))?;
        self.remember(raw);
        debug!("wrote {}", self.path.display());
        Ok(())
    }

    pub fn reload_if_changed(&mut self) -> Result<Option<Value>> {
        let modified = fs::metadata(&self.path)
            .ok()
            .and_then(|meta| meta.modified().ok());
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read manifest {}", self.path.display()))?;
        // mtime alone misses edits within the filesystem's timestamp granularity
        if self.contents.as_deref() == Some(raw.as_str()) {
            self.modified = modified;
            return Ok(None);
        }
        let body = parse_manifest(&raw)
            .with_context(|| format!("failed to parse manifest {}", self.path.display()))?;
        self.remember(raw);
        Ok(Some(body))
    }

    fn remember(&mut self, raw: String) {
        self.modified = fs::metadata(&self.path)
            .ok()
            .and_then(|meta| meta.modified().ok());
        self.contents = Some(raw);
    }
}

pub fn parse_manifest(raw: &str) -> Result<Value> {
    let body: Value = serde_yaml::from_str(raw)?;
    if !body.is_object() {
        anyhow::bail!("manifest must be a single YAML mapping");
    }
    Ok(body)
}

pub fn render_manifest(body: &Value) -> Result<String> {
    let mut body = without_server_metadata(body);
    if let Some(object) = body.as_object_mut() {
        object.remove("status");
    }
    serde_yaml::to_string(&body).context("failed to render manifest")
}
