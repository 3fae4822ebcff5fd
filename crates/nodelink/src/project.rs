//! Project entry point and module search path resolution.
//!
//! Projects live under `<app_path>/app/<project_dir>`. The entry file comes from the
//! `main` field of the project's `package.json`.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const PROJECTS_DIR: &str = "app";
pub const MANIFEST_FILE: &str = "package.json";
/// Node's own fallback when `main` is absent.
pub const DEFAULT_MAIN: &str = "index.js";

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("failed to read {}: {source}", path.display())]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid manifest {}: {source}", path.display())]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid module search path: {0}")]
    ModulePath(#[from] std::env::JoinPathsError),
}

/// The subset of `package.json` the bridge reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub main: Option<String>,
}

impl PackageManifest {
    pub fn main_file(&self) -> &str {
        self.main
            .as_deref()
            .map(str::trim)
            .filter(|main| !main.is_empty())
            .unwrap_or(DEFAULT_MAIN)
    }
}

/// Resolved location of the engine's application code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub project_path: PathBuf,
    pub main_path: PathBuf,
}

pub fn project_path(app_path: &Path, project_dir: &str) -> PathBuf {
    app_path.join(PROJECTS_DIR).join(project_dir)
}

pub async fn read_manifest(project_path: &Path) -> Result<PackageManifest, ProjectError> {
    let path = project_path.join(MANIFEST_FILE);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|source| ProjectError::ManifestRead {
            path: path.clone(),
            source,
        })?;
    serde_json::from_slice(&bytes).map_err(|source| ProjectError::ManifestParse { path, source })
}

pub async fn resolve_entry_point(project_path: &Path) -> Result<EntryPoint, ProjectError> {
    let manifest = read_manifest(project_path).await?;
    let main_path = project_path.join(manifest.main_file());
    tracing::debug!(
        name = manifest.name.as_deref().unwrap_or("<unnamed>"),
        main = %main_path.display(),
        "Resolved project entry point"
    );
    Ok(EntryPoint {
        project_path: project_path.to_path_buf(),
        main_path,
    })
}

/// `NODE_PATH` value: the project directory first, then any extra module roots.
pub fn module_search_path(
    project_path: &Path,
    extra_paths: &[PathBuf],
) -> Result<OsString, ProjectError> {
    let paths = std::iter::once(project_path).chain(extra_paths.iter().map(PathBuf::as_path));
    Ok(std::env::join_paths(paths)?)
}
