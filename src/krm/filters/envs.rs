//! Container environment upserts.

use serde::Deserialize;
use serde_yaml::Value;

use super::Filter;
use crate::krm::KrmError;

#[derive(Debug, Clone, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvsSpec {
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// Upserts environment variables into every container list in a document
/// (`containers` and `initContainers`, wherever they appear - Deployments,
/// StatefulSets, CronJobs and the like all nest them differently).
pub struct EnvsFilter {
    spec: EnvsSpec,
}

impl EnvsFilter {
    pub fn new(spec: EnvsSpec) -> Self {
        Self { spec }
    }

    fn walk(&self, value: &mut Value) {
        match value {
            Value::Mapping(map) => {
                for (key, child) in map.iter_mut() {
                    let is_container_list = key
                        .as_str()
                        .is_some_and(|k| k == "containers" || k == "initContainers");
                    if is_container_list {
                        if let Value::Sequence(containers) = child {
                            for container in containers.iter_mut() {
                                self.upsert_env(container);
                            }
                            continue;
                        }
                    }
                    self.walk(child);
                }
            }
            Value::Sequence(seq) => {
                for child in seq.iter_mut() {
                    self.walk(child);
                }
            }
            _ => {}
        }
    }

    fn upsert_env(&self, container: &mut Value) {
        let Some(map) = container.as_mapping_mut() else {
            return;
        };
        let env = map
            .entry(Value::String("env".to_string()))
            .or_insert_with(|| Value::Sequence(Vec::new()));
        let Some(env) = env.as_sequence_mut() else {
            return;
        };
        for var in &self.spec.env {
            let existing = env.iter_mut().find(|e| {
                e.get("name").and_then(Value::as_str) == Some(var.name.as_str())
            });
            match existing {
                Some(entry) => {
                    if let Some(entry) = entry.as_mapping_mut() {
                        entry.insert(
                            Value::String("value".to_string()),
                            Value::String(var.value.clone()),
                        );
                        entry.remove(&Value::String("valueFrom".to_string()));
                    }
                }
                None => {
                    let mut entry = serde_yaml::Mapping::new();
                    entry.insert(
                        Value::String("name".to_string()),
                        Value::String(var.name.clone()),
                    );
                    entry.insert(
                        Value::String("value".to_string()),
                        Value::String(var.value.clone()),
                    );
                    env.push(Value::Mapping(entry));
                }
            }
        }
    }
}

impl Filter for EnvsFilter {
    fn kind(&self) -> &'static str {
        "envs"
    }

    fn apply(&self, doc: &mut Value) -> Result<(), KrmError> {
        if !self.spec.env.is_empty() {
            self.walk(doc);
        }
        Ok(())
    }
}
