//! Lab specification types and the loader/validator for `lab.yml` files.
//!
//! A lab file is YAML, checked against the embedded `lab_v1` JSON schema
//! before being deserialized into [`LabSpec`]. Semantic checks that the
//! schema cannot express (unique provider ids) live in
//! [`LabSpec::validate_semantics`].

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

const LAB_SCHEMA: &str = include_str!("../schemas/lab_v1.jsonschema");

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("lab file not found: {0}")]
    NotFound(String),
    #[error("invalid YAML: {0}")]
    Parse(String),
    #[error("schema validation failed:\n{0}")]
    Schema(String),
    #[error("duplicate provider id in topology: {0}")]
    DuplicateProvider(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabMetadata {
    pub id: String,
    pub title: String,
    pub version: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabTopology {
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomaticCheck {
    pub id: String,
    #[serde(rename = "type")]
    pub check_type: String,
    pub provider_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabScoring {
    pub total_score: f64,
    pub automatic_checks: Vec<AutomaticCheck>,
    #[serde(default)]
    pub pass_criteria: Option<PassCriteria>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassCriteria {
    pub min_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabBody {
    pub topology: LabTopology,
    pub tasks: Vec<LabTask>,
    #[serde(default)]
    pub scoring: Option<LabScoring>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabSpec {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: LabMetadata,
    pub spec: LabBody,
}

impl LabSpec {
    /// Checks the invariants the schema cannot express. Pure, no side
    /// effects; this is the body of the orchestrator's `validating` phase.
    pub fn validate_semantics(&self) -> Result<(), SpecError> {
        let mut seen = BTreeSet::new();
        for provider in &self.spec.topology.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(SpecError::DuplicateProvider(provider.id.clone()));
            }
        }
        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.spec.topology.providers.iter().find(|p| p.id == id)
    }
}

/// Loads a lab file, validates it against the `lab_v1` schema and returns
/// the typed spec.
pub fn load(path: &Path) -> Result<LabSpec, SpecError> {
    if !path.exists() {
        return Err(SpecError::NotFound(path.display().to_string()));
    }
    let raw = fs::read_to_string(path).map_err(|e| SpecError::Parse(e.to_string()))?;
    from_yaml_str(&raw)
}

/// Validates and deserializes raw YAML. Split out from [`load`] so tests
/// and callers holding in-memory documents skip the filesystem.
pub fn from_yaml_str(raw: &str) -> Result<LabSpec, SpecError> {
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(raw).map_err(|e| SpecError::Parse(e.to_string()))?;
    let json: Value = serde_json::to_value(yaml).map_err(|e| SpecError::Parse(e.to_string()))?;
    validate_against_schema(&json)?;
    serde_json::from_value(json).map_err(|e| SpecError::Schema(e.to_string()))
}

fn validate_against_schema(document: &Value) -> Result<(), SpecError> {
    let schema: Value =
        serde_json::from_str(LAB_SCHEMA).map_err(|e| SpecError::Schema(e.to_string()))?;
    let compiled = JSONSchema::compile(&schema).map_err(|e| SpecError::Schema(e.to_string()))?;
    if let Err(errors) = compiled.validate(document) {
        let msgs = errors
            .map(|e| format!("  {} {}", e.instance_path, e))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(SpecError::Schema(msgs));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_LAB: &str = r#"
apiVersion: vriksh.dev/v2
kind: Lab
metadata:
  id: gitlab-ci-basics
  title: GitLab CI Basics
  version: "1.0"
spec:
  topology:
    providers:
      - id: gitlab-main
        type: gitlab
        config:
          image: gitlab/gitlab-ce:16.11.0-ce.0
          host_port: "8923"
  tasks:
    - id: task-1
      title: Create a pipeline
"#;

    #[test]
    fn valid_lab_parses() {
        let spec = from_yaml_str(VALID_LAB).expect("valid lab should parse");
        assert_eq!(spec.metadata.id, "gitlab-ci-basics");
        assert_eq!(spec.spec.topology.providers.len(), 1);
        assert_eq!(spec.spec.topology.providers[0].provider_type, "gitlab");
        spec.validate_semantics().expect("semantics should pass");
    }

    #[test]
    fn missing_topology_is_schema_error() {
        let raw = r#"
apiVersion: vriksh.dev/v2
kind: Lab
metadata: { id: x, title: X, version: "1" }
spec:
  tasks: []
"#;
        let err = from_yaml_str(raw).expect_err("should fail");
        assert!(matches!(err, SpecError::Schema(_)), "got: {}", err);
        assert!(err.to_string().contains("topology"), "got: {}", err);
    }

    #[test]
    fn wrong_kind_is_schema_error() {
        let raw = VALID_LAB.replace("kind: Lab", "kind: Course");
        let err = from_yaml_str(&raw).expect_err("should fail");
        assert!(matches!(err, SpecError::Schema(_)), "got: {}", err);
    }

    #[test]
    fn bad_yaml_is_parse_error() {
        let err = from_yaml_str("kind: [unclosed").expect_err("should fail");
        assert!(matches!(err, SpecError::Parse(_)), "got: {}", err);
    }

    #[test]
    fn empty_provider_list_rejected() {
        let raw = r#"
apiVersion: vriksh.dev/v2
kind: Lab
metadata: { id: x, title: X, version: "1" }
spec:
  topology:
    providers: []
  tasks: []
"#;
        let err = from_yaml_str(raw).expect_err("should fail");
        assert!(matches!(err, SpecError::Schema(_)), "got: {}", err);
    }

    #[test]
    fn duplicate_provider_ids_rejected() {
        let raw = r#"
apiVersion: vriksh.dev/v2
kind: Lab
metadata: { id: x, title: X, version: "1" }
spec:
  topology:
    providers:
      - { id: a, type: gitlab }
      - { id: a, type: gitlab }
  tasks: []
"#;
        let spec = from_yaml_str(raw).expect("schema-valid");
        let err = spec.validate_semantics().expect_err("should fail");
        assert!(err.to_string().contains("duplicate provider id"), "got: {}", err);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = load(Path::new("/nonexistent/lab.yml")).expect_err("should fail");
        assert!(matches!(err, SpecError::NotFound(_)), "got: {}", err);
    }
}
