use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use shoal_api::{ApplyResult, Object, OperatorError};

use crate::client::ApiClient;

/// A manifest holds one object, or (JSON only) an array of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum Manifest {
    One(Object),
    Many(Vec<Object>),
}

/// Parse a `.json` or `.toml` manifest.
pub fn load(path: &Path) -> anyhow::Result<Result<Vec<Object>, OperatorError>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str::<Object>(&content)
            .map(|o| vec![o])
            .map_err(|e| e.to_string()),
        _ => serde_json::from_str::<Manifest>(&content)
            .map(|m| match m {
                Manifest::One(o) => vec![o],
                Manifest::Many(v) => v,
            })
            .map_err(|e| e.to_string()),
    };
    Ok(parsed.map_err(|e| OperatorError::InvalidSpec(format!("{}: {e}", path.display()))))
}

pub async fn apply(client: &ApiClient, file: &Path) -> anyhow::Result<u8> {
    let objects = match load(file)? {
        Ok(objects) => objects,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(u8::try_from(e.exit_code()).unwrap_or(1));
        }
    };

    for object in &objects {
        let body = serde_json::to_value(object)?;
        let reply = client.post_json("/api/v1/apply", &body).await?;
        if !reply.is_success() {
            eprintln!("error: {} {}: {}", object.kind(), object.key(), reply.error());
            return Ok(super::exit_code(&reply));
        }
        let result: ApplyResult = serde_json::from_value(reply.data().clone())?;
        let outcome = serde_json::to_value(result.outcome)?;
        let outcome = outcome.as_str().unwrap_or("applied");
        match result.generation {
            Some(generation) => {
                println!("{}/{} {outcome} (generation {generation})", result.kind, result.key)
            }
            None => println!("{}/{} {outcome}", result.kind, result.key),
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_api::ObjectKind;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn load_toml_workload() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "web.toml",
            r#"
kind = "workload"
namespace = "default"
name = "web"
min_replicas = 2
max_replicas = 6

[template]
command = "web-server"
port = 8080

[template.env]
MODE = "prod"

[scaling]
target_utilization = 0.6
"#,
        );
        let objects = load(&path).unwrap().unwrap();
        assert_eq!(objects.len(), 1);
        let Object::Workload(spec) = &objects[0] else {
            panic!("expected workload");
        };
        assert_eq!(spec.max_replicas, 6);
        assert_eq!(spec.template.env["MODE"], "prod");
        assert_eq!(spec.scaling.target_utilization, 0.6);
    }

    #[test]
    fn load_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "objects.json",
            r#"[
  {"kind": "config", "namespace": "default", "name": "web-config",
   "workload": "web", "version_id": "v1", "data": {"LOG_LEVEL": "info"}},
  {"kind": "route", "namespace": "default", "name": "web",
   "host_pattern": "example.com", "path_prefix": "/", "target_workload": "web"}
]"#,
        );
        let objects = load(&path).unwrap().unwrap();
        let kinds: Vec<_> = objects.iter().map(Object::kind).collect();
        assert_eq!(kinds, vec![ObjectKind::Config, ObjectKind::Route]);
    }

    #[test]
    fn malformed_manifest_is_invalid_spec() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "bad.json", r#"{"kind": "pod", "name": "x"}"#);
        let err = load(&path).unwrap().unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load(Path::new("/nonexistent/shoal.json")).is_err());
    }
}
