//! Policy documents on disk.
//!
//! A document file holds one or more YAML documents, each a single policy object.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use super::ConfigError;
use crate::object::PolicyObject;

/// Parse every YAML document in `content` as a policy object.
pub fn parse_objects(content: &str) -> Result<Vec<PolicyObject>, ConfigError> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(serde_yaml::from_value(value)?);
    }
    Ok(objects)
}

pub fn load_objects_from_file(path: impl AsRef<Path>) -> Result<Vec<PolicyObject>, ConfigError> {
    let content = fs::read_to_string(path.as_ref())?;
    parse_objects(&content)
}

/// Load every `*.yaml` / `*.yml` file of a directory, in file name order.
pub fn load_objects_from_dir(dir: impl AsRef<Path>) -> Result<Vec<PolicyObject>, ConfigError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        if path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false)
        {
            paths.push(path);
        }
    }
    paths.sort();

    let mut objects = Vec::new();
    for path in paths {
        objects.extend(load_objects_from_file(&path)?);
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    #[test]
    fn parses_multi_document_files() {
        let content = r#"
kind: cluster
metadata: {namespace: system, name: k1}
type: kubernetes
---
kind: claim
metadata: {namespace: ns1, name: d1}
user: alice
service: web
---
"#;
        let objects = parse_objects(content).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind(), ObjectKind::Cluster);
        assert_eq!(objects[1].kind(), ObjectKind::Claim);
    }

    #[test]
    fn loads_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("b.yaml"),
            "kind: claim\nmetadata: {namespace: ns1, name: d1}\nuser: alice\nservice: web\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("a.yaml"),
            "kind: service\nmetadata: {namespace: ns1, name: web}\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let objects = load_objects_from_dir(dir.path()).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind(), ObjectKind::Service);
    }
}
