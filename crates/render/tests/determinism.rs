#![forbid(unsafe_code)]

use keel_render::{image_list, transform, FsSource, ManifestPackage, MemorySource, NamedImages, RenderMode, Renderer};

const DAEMONSET: &str = "\
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: node
spec:
  template:
    spec:
      initContainers:
        - name: init
          image: init:v1
      containers:
        - name: node
          image: node:v1
      volumes:
        - name: api-secret
          secret:
            secretName: placeholder
";

const BINDING: &str = "\
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: key-management
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: key-management
subjects:
  - kind: ServiceAccount
    name: daemonset-sa
";

fn package(ns: &str, defaults: &NamedImages, overrides: &NamedImages) -> ManifestPackage {
    let mut images = image_list(defaults);
    images.extend(image_list(overrides));
    ManifestPackage::new("node")
        .with_transforms("node/daemonset.yaml", [transform::set_pod_template_secret_volume("api-secret", "creds", None)])
        .with_transforms("node/binding.yaml", [transform::set_cluster_role_binding_subject_namespace("daemonset-sa", ns)])
        .with_namespace_and_images(ns, images)
}

fn source() -> MemorySource {
    MemorySource::new().with_file("node/daemonset.yaml", DAEMONSET).with_file("node/binding.yaml", BINDING)
}

#[test]
fn render_twice_is_byte_identical() {
    let r = Renderer::new(source());
    let defaults: NamedImages = [("node".to_string(), "reg/node:v2".to_string())].into();
    let pkg = package("storage", &defaults, &NamedImages::new());
    let a = r.render(&pkg, RenderMode::Apply).unwrap().to_yaml().unwrap();
    let b = r.render(&pkg, RenderMode::Apply).unwrap().to_yaml().unwrap();
    assert_eq!(a, b);
    assert!(a.contains("reg/node:v2"));
}

#[test]
fn cluster_spec_image_beats_environment_default() {
    let r = Renderer::new(source());
    let defaults: NamedImages = [
        ("node".to_string(), "imgA".to_string()),
        ("init".to_string(), "reg/init:v9".to_string()),
    ]
    .into();
    let overrides: NamedImages = [("node".to_string(), "imgB".to_string())].into();
    let out = r.render(&package("storage", &defaults, &overrides), RenderMode::Apply).unwrap();
    let ds = out.objects.iter().find(|o| o["kind"] == "DaemonSet").unwrap();
    // Untagged override keeps the manifest's tag.
    assert_eq!(ds.pointer("/spec/template/spec/containers/0/image").unwrap(), "imgB:v1");
    assert_eq!(ds.pointer("/spec/template/spec/initContainers/0/image").unwrap(), "reg/init:v9");
    assert_eq!(ds.pointer("/metadata/namespace").unwrap(), "storage");
    assert_eq!(ds.pointer("/spec/template/spec/volumes/0/secret/secretName").unwrap(), "creds");
}

#[test]
fn transforms_run_before_mutations() {
    let r = Renderer::new(source());
    let out = r.render(&package("tenant-a", &NamedImages::new(), &NamedImages::new()), RenderMode::Apply).unwrap();
    let crb = out.objects.iter().find(|o| o["kind"] == "ClusterRoleBinding").unwrap();
    assert!(crb.pointer("/metadata/namespace").is_none());
    assert_eq!(crb.pointer("/subjects/0/namespace").unwrap(), "tenant-a");
}

#[test]
fn fs_and_memory_sources_agree() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("node")).unwrap();
    std::fs::write(dir.path().join("node/daemonset.yaml"), DAEMONSET).unwrap();
    std::fs::write(dir.path().join("node/binding.yaml"), BINDING).unwrap();

    let pkg = package("storage", &NamedImages::new(), &NamedImages::new());
    let from_fs = Renderer::new(FsSource::new(dir.path())).render(&pkg, RenderMode::Apply).unwrap();
    let from_mem = Renderer::new(source()).render(&pkg, RenderMode::Apply).unwrap();
    assert_eq!(from_fs, from_mem);
}
