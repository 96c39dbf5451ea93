//! Reads artifact definitions and patient bundles from disk.

use std::path::{Path, PathBuf};

use bsa_core::Resource;
use bsa_kar::{ArtifactSpec, KarError, KnowledgeArtifact};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid artifact in {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: KarError,
    },

    #[error("Invalid patient bundle {path}: {message}")]
    InvalidBundle { path: PathBuf, message: String },
}

impl LoadError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn parse(path: &Path, source: serde_json::Error) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            source,
        }
    }

    fn bundle(path: &Path, message: impl Into<String>) -> Self {
        Self::InvalidBundle {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

/// Build every `*.json` artifact definition in `dir`, in file-name order.
pub async fn load_artifacts(dir: &Path) -> Result<Vec<KnowledgeArtifact>, LoadError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| LoadError::io(dir, e))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| LoadError::io(dir, e))? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut artifacts = Vec::with_capacity(paths.len());
    for path in paths {
        artifacts.push(load_artifact(&path).await?);
    }

    info!(dir = %dir.display(), count = artifacts.len(), "Artifact definitions loaded");
    Ok(artifacts)
}

pub async fn load_artifact(path: &Path) -> Result<KnowledgeArtifact, LoadError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| LoadError::io(path, e))?;
    let spec: ArtifactSpec = serde_json::from_slice(&raw).map_err(|e| LoadError::parse(path, e))?;
    debug!(path = %path.display(), artifact_id = %spec.id, "Parsed artifact definition");

    KnowledgeArtifact::build(spec).map_err(|source| LoadError::Artifact {
        path: path.to_path_buf(),
        source,
    })
}

/// Clinical data for one patient, read from a FHIR bundle.
#[derive(Debug, Clone)]
pub struct PatientBundle {
    pub patient_id: String,
    pub resources: Vec<Resource>,
}

impl PatientBundle {
    pub async fn load(path: &Path) -> Result<Self, LoadError> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| LoadError::io(path, e))?;
        let value: Value = serde_json::from_slice(&raw).map_err(|e| LoadError::parse(path, e))?;
        Self::from_value(value).map_err(|message| LoadError::bundle(path, message))
    }

    /// Accepts a Bundle whose entries hold exactly one Patient.
    pub fn from_value(value: Value) -> Result<Self, String> {
        if value.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return Err("resourceType must be Bundle".into());
        }

        let entries = value
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut resources = Vec::with_capacity(entries.len());
        for mut entry in entries {
            let Some(raw) = entry.get_mut("resource").map(Value::take) else {
                continue;
            };
            resources.push(Resource::from_value(raw).map_err(|e| e.to_string())?);
        }

        let mut patients = resources.iter().filter(|r| r.resource_type() == "Patient");
        let patient_id = match (patients.next(), patients.next()) {
            (Some(patient), None) => patient
                .id()
                .ok_or("Patient resource has no id")?
                .to_string(),
            (None, _) => return Err("bundle has no Patient resource".into()),
            (Some(_), Some(_)) => return Err("bundle has more than one Patient resource".into()),
        };

        Ok(Self {
            patient_id,
            resources,
        })
    }
}
