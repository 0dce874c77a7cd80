//! Container image references and their layered resolution.
//!
//! Images are addressed by a logical key (the image name used in the static
//! manifests). Layers are merged in order; a later layer wins per key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Logical image key -> full image reference. Empty references are ignored.
pub type NamedImages = BTreeMap<String, String>;

/// Replacement for every container whose image name equals `name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub new_name: String,
    pub new_tag: Option<String>,
    pub digest: Option<String>,
}

/// Split an image reference into `(name, tag, digest)`.
///
/// A `:` only starts a tag when it comes after the last `/`, so registry
/// ports (`reg:5000/app`) stay part of the name.
pub fn split_reference(reference: &str) -> (&str, Option<&str>, Option<&str>) {
    let (rest, digest) = match reference.split_once('@') {
        Some((r, d)) => (r, Some(d)),
        None => (reference, None),
    };
    let slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
    match rest[slash..].rfind(':') {
        Some(i) => (&rest[..slash + i], Some(&rest[slash + i + 1..]), digest),
        None => (rest, None, digest),
    }
}

impl Image {
    pub fn from_reference(name: &str, reference: &str) -> Self {
        let (new_name, tag, digest) = split_reference(reference);
        Self {
            name: name.to_string(),
            new_name: new_name.to_string(),
            new_tag: tag.map(str::to_string),
            digest: digest.map(str::to_string),
        }
    }

    /// Rewrite `current` (a container's image field). The original tag is
    /// kept when this replacement carries neither tag nor digest.
    pub fn apply_to(&self, current: &str) -> String {
        let (_, old_tag, old_digest) = split_reference(current);
        match (&self.new_tag, &self.digest) {
            (_, Some(d)) => format!("{}@{}", self.new_name, d),
            (Some(t), None) => format!("{}:{}", self.new_name, t),
            (None, None) => match (old_tag, old_digest) {
                (_, Some(d)) => format!("{}@{}", self.new_name, d),
                (Some(t), None) => format!("{}:{}", self.new_name, t),
                (None, None) => self.new_name.clone(),
            },
        }
    }
}

/// Convert named references into image replacements, skipping empty values.
pub fn image_list(named: &NamedImages) -> Vec<Image> {
    named
        .iter()
        .filter(|(_, r)| !r.trim().is_empty())
        .map(|(k, r)| Image::from_reference(k, r.trim()))
        .collect()
}

/// Merge ordered image lists; a later entry for the same key wins.
pub fn resolve(images: impl IntoIterator<Item = Image>) -> BTreeMap<String, Image> {
    let mut out = BTreeMap::new();
    for img in images {
        out.insert(img.name.clone(), img);
    }
    out
}

/// Read default images from environment variables: `(key, VAR)` pairs.
/// Unset variables are skipped.
pub fn named_images_from_env(vars: &[(&str, &str)]) -> NamedImages {
    vars.iter()
        .filter_map(|(key, var)| std::env::var(var).ok().map(|v| (key.to_string(), v)))
        .filter(|(_, v)| !v.is_empty())
        .collect()
}
