//! Strategic-merge and JSON-6902 patches.

use serde::Deserialize;
use serde_yaml::Value;

use super::Filter;
use crate::krm::{kind, name, namespace, KrmError};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatchTarget {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl PatchTarget {
    fn matches(&self, doc: &Value) -> bool {
        let by = |want: &Option<String>, have: Option<&str>| match want {
            Some(want) => have == Some(want.as_str()),
            None => true,
        };
        by(&self.kind, kind(doc)) && by(&self.name, name(doc)) && by(&self.namespace, namespace(doc))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchSpec {
    #[serde(default)]
    pub target: PatchTarget,
    /// Patch text: a leading `[` after whitespace selects JSON-6902,
    /// anything else is a strategic merge.
    pub patch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchesSpec {
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
}

enum ParsedPatch {
    Json6902(json_patch::Patch),
    StrategicMerge(Value),
}

struct TargetedPatch {
    target: PatchTarget,
    parsed: ParsedPatch,
}

/// Applies targeted patches to matching documents.
pub struct PatchesFilter {
    patches: Vec<TargetedPatch>,
}

impl PatchesFilter {
    pub fn new(spec: PatchesSpec) -> Result<Self, KrmError> {
        let mut patches = Vec::with_capacity(spec.patches.len());
        for p in spec.patches {
            let parsed = parse_patch(&p.patch)?;
            patches.push(TargetedPatch {
                target: p.target,
                parsed,
            });
        }
        Ok(Self { patches })
    }
}

fn invalid(reason: String) -> KrmError {
    KrmError::InvalidFunction {
        path: "patches".to_string(),
        reason,
    }
}

fn parse_patch(text: &str) -> Result<ParsedPatch, KrmError> {
    if text.trim_start().starts_with('[') {
        let ops: serde_json::Value = serde_yaml::from_str(text)
            .map_err(|e| invalid(format!("JSON-6902 patch does not parse: {e}")))?;
        let patch: json_patch::Patch = serde_json::from_value(ops)
            .map_err(|e| invalid(format!("JSON-6902 patch is malformed: {e}")))?;
        Ok(ParsedPatch::Json6902(patch))
    } else {
        let merge: Value = serde_yaml::from_str(text)
            .map_err(|e| invalid(format!("strategic-merge patch does not parse: {e}")))?;
        Ok(ParsedPatch::StrategicMerge(merge))
    }
}

/// Strategic merge: mappings merge recursively, a null value deletes the
/// key, and sequences of named objects merge element-wise by `name`; any
/// other sequence is replaced wholesale.
fn strategic_merge(doc: &mut Value, patch: &Value) {
    match (doc, patch) {
        (Value::Mapping(doc_map), Value::Mapping(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    doc_map.remove(key);
                    continue;
                }
                match doc_map.get_mut(key) {
                    Some(existing) => strategic_merge(existing, patch_value),
                    None => {
                        doc_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (Value::Sequence(doc_seq), Value::Sequence(patch_seq))
            if is_named_list(doc_seq) && is_named_list(patch_seq) =>
        {
            for patch_item in patch_seq {
                let item_name = patch_item.get("name").and_then(Value::as_str);
                let existing = doc_seq
                    .iter_mut()
                    .find(|d| d.get("name").and_then(Value::as_str) == item_name);
                match existing {
                    Some(existing) => strategic_merge(existing, patch_item),
                    None => doc_seq.push(patch_item.clone()),
                }
            }
        }
        (doc, patch) => *doc = patch.clone(),
    }
}

fn is_named_list(seq: &[Value]) -> bool {
    !seq.is_empty() && seq.iter().all(|v| v.get("name").is_some())
}

fn apply_json6902(doc: &mut Value, patch: &json_patch::Patch) -> Result<(), KrmError> {
    let mut json = serde_json::to_value(&*doc)
        .map_err(|e| invalid(format!("document is not JSON-compatible: {e}")))?;
    json_patch::patch(&mut json, patch)
        .map_err(|e| invalid(format!("JSON-6902 patch failed: {e}")))?;
    *doc = serde_yaml::to_value(json)
        .map_err(|e| invalid(format!("patched document does not round-trip: {e}")))?;
    Ok(())
}

impl Filter for PatchesFilter {
    fn kind(&self) -> &'static str {
        "patches"
    }

    fn apply(&self, doc: &mut Value) -> Result<(), KrmError> {
        for patch in &self.patches {
            if !patch.target.matches(doc) {
                continue;
            }
            match &patch.parsed {
                ParsedPatch::Json6902(ops) => apply_json6902(doc, ops)?,
                ParsedPatch::StrategicMerge(merge) => strategic_merge(doc, merge),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Value {
        serde_yaml::from_str(
            r"
kind: Deployment
metadata: {name: web}
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: web
          image: web:v1
        - name: sidecar
          image: sidecar:v1
",
        )
        .unwrap()
    }

    #[test]
    fn test_strategic_merge_by_name() {
        let spec: PatchesSpec = serde_yaml::from_str(
            r"
patches:
  - target: {kind: Deployment, name: web}
    patch: |
      spec:
        replicas: 3
        template:
          spec:
            containers:
              - name: sidecar
                image: sidecar:v2
",
        )
        .unwrap();
        let filter = PatchesFilter::new(spec).unwrap();
        let mut doc = deployment();
        filter.apply(&mut doc).unwrap();

        let rendered = serde_yaml::to_string(&doc).unwrap();
        assert!(rendered.contains("replicas: 3"));
        assert!(rendered.contains("image: web:v1"));
        assert!(rendered.contains("image: sidecar:v2"));
    }

    #[test]
    fn test_json6902_selected_by_leading_bracket() {
        let spec: PatchesSpec = serde_yaml::from_str(
            r#"
patches:
  - target: {kind: Deployment}
    patch: '[{"op": "replace", "path": "/spec/replicas", "value": 5}]'
"#,
        )
        .unwrap();
        let filter = PatchesFilter::new(spec).unwrap();
        let mut doc = deployment();
        filter.apply(&mut doc).unwrap();
        assert!(serde_yaml::to_string(&doc).unwrap().contains("replicas: 5"));
    }

    #[test]
    fn test_non_matching_target_untouched() {
        let spec: PatchesSpec = serde_yaml::from_str(
            r"
patches:
  - target: {kind: StatefulSet}
    patch: |
      spec: {replicas: 9}
",
        )
        .unwrap();
        let filter = PatchesFilter::new(spec).unwrap();
        let mut doc = deployment();
        filter.apply(&mut doc).unwrap();
        assert!(serde_yaml::to_string(&doc).unwrap().contains("replicas: 1"));
    }

    #[test]
    fn test_null_deletes_key() {
        let spec: PatchesSpec = serde_yaml::from_str(
            r"
patches:
  - patch: |
      spec:
        replicas: null
",
        )
        .unwrap();
        let filter = PatchesFilter::new(spec).unwrap();
        let mut doc = deployment();
        filter.apply(&mut doc).unwrap();
        assert!(!serde_yaml::to_string(&doc).unwrap().contains("replicas"));
    }
}
