//! Schema model registry
//!
//! Loads every bundled version of a named data model. A bundle lays the
//! versions of model `Notes` out like this:
//!
//! ```text
//! Notes.models/Notes.toml          version 1
//! Notes.models/Notes 2.toml        version 2
//! Notes.models/Notes 3.toml        version 3
//! Notes.models/current             optional, e.g. "Notes 3"
//! Notes.models/mappings/*.toml     optional explicit mappings
//! ```
//!
//! Versions are ordered by the number following the first space of the
//! resource name. Names without that token (the original, unnumbered
//! version) sort by their count of space-separated components instead.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::mapping::MappingStep;
use crate::model::SchemaModel;

/// File extension of model resources
pub const MODEL_EXTENSION: &str = "toml";

/// A read-only container of model resources
///
/// Paths are relative and `/`-separated.
pub trait ResourceBundle: Send + Sync {
    /// File names directly inside `directory`; empty if it does not exist
    fn list(&self, directory: &str) -> io::Result<Vec<String>>;

    /// Contents of the resource at `path`, `None` if it does not exist
    fn read(&self, path: &str) -> io::Result<Option<String>>;
}

/// Bundle backed by a directory on disk
#[derive(Debug, Clone)]
pub struct DirectoryBundle {
    root: PathBuf,
}

impl DirectoryBundle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceBundle for DirectoryBundle {
    fn list(&self, directory: &str) -> io::Result<Vec<String>> {
        let path = self.root.join(directory);
        if !path.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, path: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.root.join(path)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Bundle held in memory (useful for testing and embedded resources)
#[derive(Debug, Clone, Default)]
pub struct MemoryBundle {
    files: BTreeMap<String, String>,
}

impl MemoryBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource, replacing any existing one at `path`
    pub fn with(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }
}

impl ResourceBundle for MemoryBundle {
    fn list(&self, directory: &str) -> io::Result<Vec<String>> {
        let prefix = format!("{}/", directory.trim_end_matches('/'));
        Ok(self
            .files
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn read(&self, path: &str) -> io::Result<Option<String>> {
        Ok(self.files.get(path).cloned())
    }
}

/// Compare two resource names the way model versions are ordered
pub fn compare_resource_names(left: &str, right: &str) -> Ordering {
    ordering_key(left).cmp(&ordering_key(right))
}

/// Unnumbered names first, then numbered names by their token
fn ordering_key(name: &str) -> (bool, u32) {
    let components: Vec<&str> = name.split(' ').collect();
    if components.len() > 1 {
        (true, version_token(&components))
    } else {
        (false, 0)
    }
}

fn version_token(components: &[&str]) -> u32 {
    components
        .get(1)
        .and_then(|token| token.parse().ok())
        .unwrap_or(0)
}

/// Ordinal version encoded in a resource name; unnumbered names are version 1
pub fn version_of(resource_name: &str) -> u32 {
    let components: Vec<&str> = resource_name.split(' ').collect();
    if components.len() > 1 {
        version_token(&components)
    } else {
        1
    }
}

/// Loads model versions and explicit mappings from a bundle
#[derive(Clone)]
pub struct ModelRegistry {
    bundle: Arc<dyn ResourceBundle>,
}

impl ModelRegistry {
    pub fn new(bundle: Arc<dyn ResourceBundle>) -> Self {
        Self { bundle }
    }

    /// Load the current version of a model
    ///
    /// The current version is named by the `current` resource if present,
    /// otherwise it is the newest bundled version.
    pub fn load(&self, name: &str) -> Result<SchemaModel> {
        let directory = models_directory(name);
        let current = self
            .read(&format!("{}/current", directory))?
            .map(|content| content.trim().to_string());

        match current {
            Some(resource) => self
                .load_resource(name, &resource)?
                .ok_or_else(|| Error::ModelNotFound {
                    name: resource.clone(),
                }),
            None => self
                .load_all_versions(name)?
                .pop()
                .ok_or_else(|| Error::ModelNotFound {
                    name: name.to_string(),
                }),
        }
    }

    /// Load every bundled version of a model, oldest first
    pub fn load_all_versions(&self, name: &str) -> Result<Vec<SchemaModel>> {
        let mut resources = self.resource_names(name)?;
        resources.sort_by_key(|resource| ordering_key(resource));

        let mut models = Vec::with_capacity(resources.len());
        for resource in resources {
            if let Some(model) = self.load_resource(name, &resource)? {
                models.push(model);
            }
        }

        for pair in models.windows(2) {
            if pair[0].version() == pair[1].version() {
                return Err(Error::InvalidModel {
                    resource: pair[1].name().to_string(),
                    details: format!("version {} is bundled twice", pair[1].version()),
                });
            }
        }

        debug!(
            "Loaded {} version(s) of model '{}'",
            models.len(),
            name
        );
        Ok(models)
    }

    /// Load the explicit mapping between two versions, if one is bundled
    pub fn load_mapping(
        &self,
        name: &str,
        source: &SchemaModel,
        destination: &SchemaModel,
    ) -> Result<Option<MappingStep>> {
        let directory = format!("{}/mappings", models_directory(name));
        let files = self
            .bundle
            .list(&directory)
            .map_err(|e| resource_error(&directory, e))?;

        for file in files.iter().filter(|f| has_model_extension(f)) {
            let path = format!("{}/{}", directory, file);
            let Some(content) = self.read(&path)? else {
                continue;
            };
            let step = MappingStep::from_toml(&content, source, destination).map_err(|e| {
                Error::InvalidModel {
                    resource: path.clone(),
                    details: e.to_string(),
                }
            })?;
            if step.is_some() {
                debug!("Using explicit mapping '{}'", path);
                return Ok(step);
            }
        }

        Ok(None)
    }

    fn resource_names(&self, name: &str) -> Result<Vec<String>> {
        let directory = models_directory(name);
        let files = self
            .bundle
            .list(&directory)
            .map_err(|e| resource_error(&directory, e))?;

        Ok(files
            .iter()
            .filter(|f| has_model_extension(f))
            .map(|f| f[..f.len() - MODEL_EXTENSION.len() - 1].to_string())
            .collect())
    }

    fn load_resource(&self, name: &str, resource: &str) -> Result<Option<SchemaModel>> {
        let path = format!("{}/{}.{}", models_directory(name), resource, MODEL_EXTENSION);
        match self.read(&path)? {
            Some(content) => SchemaModel::from_toml(resource, version_of(resource), &content).map(Some),
            None => Ok(None),
        }
    }

    fn read(&self, path: &str) -> Result<Option<String>> {
        self.bundle.read(path).map_err(|e| resource_error(path, e))
    }
}

fn models_directory(name: &str) -> String {
    format!("{}.models", name)
}

fn has_model_extension(file: &str) -> bool {
    Path::new(file).extension().and_then(|e| e.to_str()) == Some(MODEL_EXTENSION)
}

fn resource_error(resource: &str, error: io::Error) -> Error {
    Error::InvalidModel {
        resource: resource.to_string(),
        details: error.to_string(),
    }
}
