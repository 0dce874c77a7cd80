//! Keel render: turns a static manifest package plus runtime parameters into
//! the concrete object set an operand applies or deletes.
//!
//! Steps, in order: load the package from a [`ContentSource`], run per-path
//! transforms in declaration order, then run package-wide mutations
//! (namespace injection, image substitution). Rendering never talks to the
//! platform; the same inputs always yield the same output.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::RenderError;
use metrics::counter;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

pub mod images;
pub mod source;
pub mod transform;

pub use images::{image_list, named_images_from_env, resolve, Image, NamedImages};
pub use source::{ContentSource, FsSource, ManifestFile, MemorySource};
pub use transform::{MutateFn, TransformFn};

/// Whether the rendered set is about to be applied or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Apply,
    /// Objects come back in reverse order so dependents go first.
    Delete,
}

/// A named package plus the functions applied to it. Built fresh for every
/// render from the owning resource's parameters.
#[derive(Clone)]
pub struct ManifestPackage {
    name: String,
    transforms: BTreeMap<String, Vec<TransformFn>>,
    mutations: Vec<MutateFn>,
}

impl ManifestPackage {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), transforms: BTreeMap::new(), mutations: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append transforms for manifest `path` (`<package>/<file>`).
    pub fn with_transforms(mut self, path: &str, tfs: impl IntoIterator<Item = TransformFn>) -> Self {
        self.transforms.entry(path.to_string()).or_default().extend(tfs);
        self
    }

    pub fn with_mutation(mut self, m: MutateFn) -> Self {
        self.mutations.push(m);
        self
    }

    /// Shorthand for the two standard mutations: target namespace, then images.
    pub fn with_namespace_and_images(self, namespace: &str, images: Vec<Image>) -> Self {
        self.with_mutation(transform::add_namespace(namespace))
            .with_mutation(transform::add_images(resolve(images)))
    }
}

impl std::fmt::Debug for ManifestPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestPackage")
            .field("name", &self.name)
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .field("mutations", &self.mutations.len())
            .finish()
    }
}

/// Concrete, ready-to-apply objects.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub objects: Vec<Json>,
}

impl Rendered {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Multi-document YAML stream.
    pub fn to_yaml(&self) -> Result<String, RenderError> {
        let mut out = String::new();
        for obj in &self.objects {
            let doc = serde_yaml::to_string(obj)
                .map_err(|e| RenderError::Parse { path: "<output>".into(), message: e.to_string() })?;
            out.push_str("---\n");
            out.push_str(&doc);
        }
        Ok(out)
    }
}

fn parse_documents(file: &ManifestFile) -> Result<Vec<Json>, RenderError> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(&file.content) {
        let val = Json::deserialize(de)
            .map_err(|e| RenderError::Parse { path: file.path.clone(), message: e.to_string() })?;
        match val {
            Json::Null => continue,
            Json::Object(_) => docs.push(val),
            _ => {
                return Err(RenderError::Parse {
                    path: file.path.clone(),
                    message: "document is not a mapping".into(),
                })
            }
        }
    }
    Ok(docs)
}

/// Renders packages out of one content source.
pub struct Renderer<S> {
    source: S,
}

impl<S: ContentSource> Renderer<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn render(&self, pkg: &ManifestPackage, mode: RenderMode) -> Result<Rendered, RenderError> {
        counter!("render_total", 1u64);
        let files = self.source.load(&pkg.name)?;
        for path in pkg.transforms.keys() {
            if !files.iter().any(|f| &f.path == path) {
                counter!("render_err", 1u64);
                return Err(RenderError::UnknownPath(path.clone()));
            }
        }

        let mut objects = Vec::new();
        for file in &files {
            let mut docs = parse_documents(file)?;
            if let Some(tfs) = pkg.transforms.get(&file.path) {
                for doc in docs.iter_mut() {
                    for tf in tfs {
                        tf(doc).map_err(|message| RenderError::Transform { path: file.path.clone(), message })?;
                    }
                }
            }
            objects.extend(docs);
        }
        if objects.is_empty() {
            return Err(RenderError::EmptyPackage(pkg.name.clone()));
        }

        for m in &pkg.mutations {
            m(objects.as_mut_slice()).map_err(|message| RenderError::Transform { path: pkg.name.clone(), message })?;
        }
        if mode == RenderMode::Delete {
            objects.reverse();
        }
        debug!(package = %pkg.name, objects = objects.len(), ?mode, "rendered");
        Ok(Rendered { objects })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOY: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: api-manager
spec:
  template:
    spec:
      containers:
        - name: api-manager
          image: api-manager
";

    fn source() -> MemorySource {
        MemorySource::new()
            .with_file("api-manager/deployment.yaml", DEPLOY)
            .with_file(
                "api-manager/rbac.yaml",
                "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: sa\n---\n\
                 apiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: r\n",
            )
    }

    #[test]
    fn order_follows_path_then_document() {
        let r = Renderer::new(source());
        let out = r.render(&ManifestPackage::new("api-manager"), RenderMode::Apply).unwrap();
        let kinds: Vec<_> = out.objects.iter().map(|o| o["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["Deployment", "ServiceAccount", "ClusterRole"]);

        let del = r.render(&ManifestPackage::new("api-manager"), RenderMode::Delete).unwrap();
        assert_eq!(del.objects[0]["kind"], "ClusterRole");
    }

    #[test]
    fn unknown_transform_path_is_rejected() {
        let r = Renderer::new(source());
        let pkg = ManifestPackage::new("api-manager")
            .with_transforms("api-manager/missing.yaml", [transform::set_metadata_name("x")]);
        assert!(matches!(r.render(&pkg, RenderMode::Apply), Err(RenderError::UnknownPath(_))));
    }

    #[test]
    fn transform_errors_carry_the_path() {
        let r = Renderer::new(source());
        let pkg = ManifestPackage::new("api-manager")
            .with_transforms("api-manager/deployment.yaml", [transform::set_configmap_data("k", "v")]);
        let e = r.render(&pkg, RenderMode::Apply).unwrap_err();
        assert!(e.to_string().contains("api-manager/deployment.yaml"), "e={}", e);
    }

    #[test]
    fn scalar_documents_are_rejected() {
        let r = Renderer::new(MemorySource::new().with_file("x/a.yaml", "just a string\n"));
        assert!(matches!(r.render(&ManifestPackage::new("x"), RenderMode::Apply), Err(RenderError::Parse { .. })));
    }
}
