//! YAML parsing and validation of Deployment and Tile documents.
//!
//! Structural constraints checked here:
//! - apiVersion must be `mahjong.io/v1alpha1`
//! - kind must match the document
//! - a deployment must declare at least one tile
//! - dependsOn references must name declared instances
//! - no value may still carry a `<<placeholder>>`

use super::error::{Error, Result};
use super::types::*;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

#[allow(clippy::unwrap_used)]
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<<[^<>]+>>").unwrap());

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn invalid(message: String) -> ValidationError {
    ValidationError { message }
}

/// Parse a deployment file from disk.
pub fn parse_deployment_file(path: &Path) -> Result<Deployment> {
    let content = std::fs::read(path)?;
    parse_deployment(&content)
}

/// Parse a deployment document.
pub fn parse_deployment(bytes: &[u8]) -> Result<Deployment> {
    serde_yaml_ng::from_slice(bytes).map_err(|e| Error::Parse(format!("deployment: {}", e)))
}

/// Parse a tile descriptor.
pub fn parse_tile(bytes: &[u8]) -> Result<Tile> {
    serde_yaml_ng::from_slice(bytes).map_err(|e| Error::Parse(format!("tile: {}", e)))
}

/// Parse and validate in one step; validation failures become one error.
pub fn load_deployment(bytes: &[u8]) -> Result<Deployment> {
    let deployment = parse_deployment(bytes)?;
    let errors = validate_deployment(&deployment);
    if !errors.is_empty() {
        return Err(Error::Validation(
            errors.into_iter().map(|e| e.message).collect(),
        ));
    }
    Ok(deployment)
}

/// Validate a parsed deployment. Returns a list of errors (empty = valid).
pub fn validate_deployment(deployment: &Deployment) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    check_header(&deployment.api_version, &deployment.kind, "Deployment", &mut errors);

    if deployment.metadata.name.is_empty() {
        errors.push(invalid("metadata.name must not be empty".to_string()));
    }

    let tiles = &deployment.spec.template.tiles;
    if tiles.is_empty() {
        errors.push(invalid("deployment declares no tiles".to_string()));
    }

    for (id, tile) in tiles {
        if tile.tile_reference.is_empty() {
            errors.push(invalid(format!("instance '{}' has no tileReference", id)));
        }
        for dep in &tile.depends_on {
            if dep == id {
                errors.push(invalid(format!("instance '{}' depends on itself", id)));
            } else if !tiles.contains_key(dep) {
                errors.push(invalid(format!(
                    "instance '{}' depends on unknown instance '{}'",
                    id, dep
                )));
            }
        }
        for input in &tile.inputs {
            let values = input.input_value.iter().chain(input.input_values.iter());
            for value in values {
                let text = yaml_value_to_string(value);
                if PLACEHOLDER.is_match(&text) {
                    errors.push(invalid(format!(
                        "instance '{}' input '{}' still holds placeholder '{}'",
                        id, input.name, text
                    )));
                }
            }
        }
    }

    errors
}

/// Validate a parsed tile.
pub fn validate_tile(tile: &Tile) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    check_header(&tile.api_version, &tile.kind, "Tile", &mut errors);

    let name = &tile.metadata.name;
    for input in &tile.spec.inputs {
        for dep in &input.dependencies {
            if tile.dependency(&dep.name).is_none() {
                errors.push(invalid(format!(
                    "tile '{}' input '{}' references undeclared dependency '{}'",
                    name, input.name, dep.name
                )));
            }
        }
        if let Some(target) = &input.override_target {
            if tile.dependency(&target.name).is_none() {
                errors.push(invalid(format!(
                    "tile '{}' input '{}' overrides undeclared dependency '{}'",
                    name, input.name, target.name
                )));
            }
        }
    }
    for output in &tile.spec.outputs {
        if output.name.is_empty() {
            errors.push(invalid(format!("tile '{}' has an unnamed output", name)));
        }
    }
    errors
}

fn check_header(api_version: &str, kind: &str, expected: &str, errors: &mut Vec<ValidationError>) {
    if api_version != API_VERSION {
        errors.push(invalid(format!(
            "apiVersion must be \"{}\", got \"{}\"",
            API_VERSION, api_version
        )));
    }
    if kind != expected {
        errors.push(invalid(format!(
            "kind must be \"{}\", got \"{}\"",
            expected, kind
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = r#"
apiVersion: mahjong.io/v1alpha1
kind: Deployment
metadata:
  name: eks-simple
spec:
  template:
    tiles:
      net:
        tileReference: Network0
        tileVersion: 0.0.1
      eks:
        tileReference: Eks0
        tileVersion: 0.0.5
        dependsOn: [net]
  summary:
    description: simple eks
    outputs:
      - name: cluster
        value: $(eks.outputs.clusterName)
"#;

    #[test]
    fn test_parser_parse_valid() {
        let d = load_deployment(DEPLOYMENT.as_bytes()).unwrap();
        assert_eq!(d.metadata.name, "eks-simple");
        assert_eq!(d.original_order(), vec!["net", "eks"]);
        assert_eq!(d.spec.summary.outputs.len(), 1);
    }

    #[test]
    fn test_parser_bad_api_version() {
        let yaml = DEPLOYMENT.replace("mahjong.io/v1alpha1", "mahjong.io/v2");
        let d = parse_deployment(yaml.as_bytes()).unwrap();
        let errors = validate_deployment(&d);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("apiVersion"));
    }

    #[test]
    fn test_parser_wrong_kind() {
        let yaml = DEPLOYMENT.replace("kind: Deployment", "kind: Tile");
        let d = parse_deployment(yaml.as_bytes()).unwrap();
        assert!(validate_deployment(&d)
            .iter()
            .any(|e| e.message.contains("kind must be")));
    }

    #[test]
    fn test_parser_unknown_depends_on() {
        let yaml = DEPLOYMENT.replace("dependsOn: [net]", "dependsOn: [vpc]");
        let err = load_deployment(yaml.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("unknown instance 'vpc'"));
    }

    #[test]
    fn test_parser_placeholder_rejected() {
        let yaml = format!(
            "{}        inputs:\n          - name: cidr\n            inputValue: <<cidr>>\n",
            DEPLOYMENT.split("  summary:").next().unwrap()
        );
        let d = parse_deployment(yaml.as_bytes()).unwrap();
        let errors = validate_deployment(&d);
        assert!(errors.iter().any(|e| e.message.contains("placeholder")));
    }

    #[test]
    fn test_parser_no_tiles() {
        let yaml = "apiVersion: mahjong.io/v1alpha1\nkind: Deployment\nmetadata:\n  name: x\nspec:\n  template:\n    tiles: {}\n";
        let d = parse_deployment(yaml.as_bytes()).unwrap();
        assert!(validate_deployment(&d)
            .iter()
            .any(|e| e.message.contains("no tiles")));
    }

    #[test]
    fn test_parser_malformed_yaml() {
        let err = parse_deployment(b"kind: [unterminated").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_parser_tile_undeclared_dependency() {
        let yaml = r#"
apiVersion: mahjong.io/v1alpha1
kind: Tile
metadata:
  name: Eks0
  category: ContainerProvider
  version: 0.0.5
spec:
  inputs:
    - name: vpc
      dependencies:
        - name: network
          field: baseVpc
"#;
        let tile = parse_tile(yaml.as_bytes()).unwrap();
        let errors = validate_tile(&tile);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("undeclared dependency 'network'"));
    }
}
