//! Input and output contract with the host build system.
//!
//! A [`TransformInvocation`] describes what the build hands over: archive
//! and directory inputs with their incremental status. An
//! [`OutputProvider`] decides where each input's transformed counterpart
//! lives.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    NotChanged,
    Added,
    Changed,
    Removed,
    /// Status the build could not determine; treated like `NotChanged`.
    Unknown,
}

impl Status {
    pub fn needs_processing(self) -> bool {
        matches!(self, Status::Added | Status::Changed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContentType {
    Classes,
    Resources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    Project,
    SubProjects,
    ExternalLibraries,
    TestedCode,
    ProvidedOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    Jar,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JarInput {
    pub name: String,
    pub file: PathBuf,
    #[serde(default = "default_content_types")]
    pub content_types: Vec<ContentType>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInput {
    pub name: String,
    pub file: PathBuf,
    #[serde(default = "default_content_types")]
    pub content_types: Vec<ContentType>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<Scope>,
    /// Absolute paths of files under `file` that changed since the last
    /// build. Only consulted for incremental invocations.
    #[serde(default)]
    pub changed_files: BTreeMap<PathBuf, Status>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformInput {
    #[serde(default)]
    pub jar_inputs: Vec<JarInput>,
    #[serde(default)]
    pub directory_inputs: Vec<DirectoryInput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformInvocation {
    #[serde(default)]
    pub incremental: bool,
    pub build_dir: PathBuf,
    #[serde(default)]
    pub applied_plugins: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<TransformInput>,
}

impl TransformInvocation {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read invocation: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse invocation: {}", path.display()))
    }

    pub fn has_plugin(&self, id: &str) -> bool {
        self.applied_plugins.iter().any(|p| p == id)
    }

    /// Build intermediates that the dexer caches from earlier outputs.
    pub fn dex_builder_dir(&self) -> PathBuf {
        self.build_dir
            .join("intermediates")
            .join("transforms")
            .join("dexBuilder")
    }
}

fn default_content_types() -> Vec<ContentType> {
    vec![ContentType::Classes]
}

fn default_scopes() -> Vec<Scope> {
    vec![Scope::Project]
}

/// Allocates output locations. Implementations must be deterministic: the
/// same arguments always map to the same path.
pub trait OutputProvider: Send + Sync {
    fn content_location(
        &self,
        name: &str,
        content_types: &[ContentType],
        scopes: &[Scope],
        format: Format,
    ) -> PathBuf;

    /// Removes every output previously handed out.
    fn delete_all(&self) -> std::io::Result<()>;
}

/// Lays outputs out under `root/jars` and `root/dirs` with names derived
/// from a hash of the location request.
#[derive(Debug, Clone)]
pub struct DirectoryOutputProvider {
    root: PathBuf,
}

impl DirectoryOutputProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn format_dir(&self, format: Format) -> PathBuf {
        match format {
            Format::Jar => self.root.join("jars"),
            Format::Directory => self.root.join("dirs"),
        }
    }
}

impl OutputProvider for DirectoryOutputProvider {
    fn content_location(
        &self,
        name: &str,
        content_types: &[ContentType],
        scopes: &[Scope],
        format: Format,
    ) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        for content_type in content_types {
            hasher.update(format!("|{content_type:?}").as_bytes());
        }
        for scope in scopes {
            hasher.update(format!("|{scope:?}").as_bytes());
        }
        hasher.update(format!("|{format:?}").as_bytes());
        let digest = hex::encode(hasher.finalize());

        let stem: String = Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let file_name = format!("{stem}-{}", &digest[..16]);

        match format {
            Format::Jar => self.format_dir(format).join(format!("{file_name}.jar")),
            Format::Directory => self.format_dir(format).join(file_name),
        }
    }

    fn delete_all(&self) -> std::io::Result<()> {
        for format in [Format::Jar, Format::Directory] {
            let dir = self.format_dir(format);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}
