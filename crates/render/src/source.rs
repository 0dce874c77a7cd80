//! Read-only stores of named manifest packages.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use keel_core::RenderError;
use tracing::debug;

/// One manifest file of a package: path relative to the source root
/// (`<package>/<file>`) and its raw YAML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub path: String,
    pub content: String,
}

/// Hierarchical store of packages. Files are returned sorted by path.
pub trait ContentSource: Send + Sync {
    fn load(&self, package: &str) -> Result<Vec<ManifestFile>, RenderError>;
}

impl<T: ContentSource + ?Sized> ContentSource for std::sync::Arc<T> {
    fn load(&self, package: &str) -> Result<Vec<ManifestFile>, RenderError> {
        (**self).load(package)
    }
}

impl<T: ContentSource + ?Sized> ContentSource for Box<T> {
    fn load(&self, package: &str) -> Result<Vec<ManifestFile>, RenderError> {
        (**self).load(package)
    }
}

/// Directory-backed source: one sub-directory per package, every `*.yaml` /
/// `*.yml` below it belongs to the package.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn is_manifest(p: &Path) -> bool {
    matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
}

/// Symlinked directories are not followed; symlinked files are read.
fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RenderError> {
    let io_err = |source| RenderError::Io { path: dir.display().to_string(), source };
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        let kind = entry.file_type().map_err(io_err)?;
        if kind.is_dir() {
            walk(&path, out)?;
        } else if kind.is_symlink() && path.is_dir() {
            debug!(path = %path.display(), "skipping symlinked directory");
        } else if is_manifest(&path) {
            out.push(path);
        }
    }
    Ok(())
}

impl ContentSource for FsSource {
    fn load(&self, package: &str) -> Result<Vec<ManifestFile>, RenderError> {
        let dir = self.root.join(package);
        if !dir.is_dir() {
            return Err(RenderError::MissingPackage(package.to_string()));
        }
        let mut paths = Vec::new();
        walk(&dir, &mut paths)?;
        let mut files = Vec::with_capacity(paths.len());
        for p in paths {
            let content = std::fs::read_to_string(&p)
                .map_err(|source| RenderError::Io { path: p.display().to_string(), source })?;
            // Relative, slash-separated, so transform keys are platform independent.
            let rel = p
                .strip_prefix(&self.root)
                .unwrap_or(p.as_path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            files.push(ManifestFile { path: rel, content });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(package, files = files.len(), root = %self.root.display(), "loaded package");
        Ok(files)
    }
}

/// In-memory source keyed by relative path.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: BTreeMap<String, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.insert(path, content);
        self
    }

    pub fn insert(&mut self, path: &str, content: &str) {
        self.files.insert(path.to_string(), content.to_string());
    }
}

impl ContentSource for MemorySource {
    fn load(&self, package: &str) -> Result<Vec<ManifestFile>, RenderError> {
        let prefix = format!("{}/", package);
        let files: Vec<_> = self
            .files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| ManifestFile { path: k.clone(), content: v.clone() })
            .collect();
        if files.is_empty() {
            return Err(RenderError::MissingPackage(package.to_string()));
        }
        Ok(files)
    }
}
