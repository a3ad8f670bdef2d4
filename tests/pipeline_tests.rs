//! End-to-end tests of the KRM transformation pipeline: a realistic package
//! with layered functions, config-map wrapping, patches, and image rewrites.

mod common;

use common::{read_file, write_file};
use hydros::krm::Pipeline;

fn build_package(root: &std::path::Path) {
    write_file(
        root,
        "manifests/app/deploy.yaml",
        r"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: web
          image: gcr.io/dev-project/web:v3
",
    );
    write_file(
        root,
        "manifests/app/crd.yaml",
        r"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.com
spec:
  sample:
    image: gcr.io/dev-project/widget
",
    );
    write_file(
        root,
        "manifests/app/settings.yaml",
        r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: embedded
data:
  inner.yaml: |
    kind: Deployment
    metadata:
      name: inner
  plain.txt: "untouched"
"#,
    );
    // Shared functions at the package root.
    write_file(
        root,
        "manifests/functions/labels.yaml",
        r"
apiVersion: hydros.dev/v1alpha1
kind: labels
metadata:
  name: common-labels
spec:
  labels:
    app.kubernetes.io/managed-by: hydros
",
    );
    write_file(
        root,
        "manifests/functions/images.yaml",
        r"
apiVersion: hydros.dev/v1alpha1
kind: images
metadata:
  name: prod-registry
spec:
  mappings:
    - from: gcr.io/dev-project/
      to: ghcr.io/prod-org/
",
    );
    write_file(
        root,
        "manifests/functions/wrapped-labels.yaml",
        r"
apiVersion: hydros.dev/v1alpha1
kind: labels
metadata:
  name: embedded-labels
  annotations:
    hydros.dev/wrap-in-configmap: 'true'
spec:
  labels:
    injected: 'yes'
",
    );
    // App-scoped patch, deeper than the shared functions.
    write_file(
        root,
        "manifests/app/functions/scale.yaml",
        r"
apiVersion: hydros.dev/v1alpha1
kind: patches
metadata:
  name: scale-web
spec:
  patches:
    - target: {kind: Deployment, name: web}
      patch: |
        spec:
          replicas: 3
",
    );
}

fn pipeline(root: &std::path::Path) -> Pipeline {
    Pipeline::new(
        root,
        &["manifests".to_string()],
        &["manifests/**/*.yaml".to_string()],
    )
    .expect("valid pipeline")
}

#[test]
fn test_full_pipeline_render() {
    let dir = tempfile::tempdir().unwrap();
    build_package(dir.path());
    pipeline(dir.path()).run().unwrap();

    let deploy = read_file(dir.path(), "manifests/app/deploy.yaml");
    assert!(deploy.contains("app.kubernetes.io/managed-by: hydros"));
    assert!(deploy.contains("image: ghcr.io/prod-org/web:v3"));
    assert!(deploy.contains("replicas: 3"));

    // CRDs are untouched: no image rewrite, no labels without the opt-in.
    let crd = read_file(dir.path(), "manifests/app/crd.yaml");
    assert!(crd.contains("gcr.io/dev-project/widget"));
    assert!(!crd.contains("app.kubernetes.io/managed-by"));

    // The wrapped labels filter reached into the config-map value.
    let settings = read_file(dir.path(), "manifests/app/settings.yaml");
    assert!(settings.contains("injected"));
    assert!(settings.contains("untouched"));
}

#[test]
fn test_pipeline_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    build_package(dir.path());

    pipeline(dir.path()).run().unwrap();
    let first: Vec<String> = ["deploy", "crd", "settings"]
        .iter()
        .map(|n| read_file(dir.path(), &format!("manifests/app/{n}.yaml")))
        .collect();

    pipeline(dir.path()).run().unwrap();
    let second: Vec<String> = ["deploy", "crd", "settings"]
        .iter()
        .map(|n| read_file(dir.path(), &format!("manifests/app/{n}.yaml")))
        .collect();

    assert_eq!(first, second);
}

#[test]
fn test_crd_opt_in_allows_labels() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "manifests/crd.yaml",
        "kind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.com\n",
    );
    write_file(
        dir.path(),
        "manifests/functions/labels.yaml",
        r"
apiVersion: hydros.dev/v1alpha1
kind: labels
metadata:
  name: crd-labels
  annotations:
    hydros.dev/include-crds: 'true'
spec:
  labels: {audited: 'yes'}
",
    );
    pipeline(dir.path()).run().unwrap();
    let crd = read_file(dir.path(), "manifests/crd.yaml");
    assert!(crd.contains("audited"));
}

#[test]
fn test_broken_files_are_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    build_package(dir.path());
    write_file(dir.path(), "manifests/app/broken.yaml", "kind: [unterminated\n");

    pipeline(dir.path()).run().unwrap();
    // The broken file is still there, untouched.
    let broken = read_file(dir.path(), "manifests/app/broken.yaml");
    assert_eq!(broken, "kind: [unterminated\n");
}
