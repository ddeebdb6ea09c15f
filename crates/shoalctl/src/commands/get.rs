use serde_json::Value;

use crate::client::ApiClient;

use super::{exit_code, finish, object_path};

pub async fn get(client: &ApiClient, kind: &str, key: &str, namespace: &str) -> anyhow::Result<u8> {
    let reply = client.get(&object_path(kind, key, namespace)).await?;
    finish(&reply)
}

pub async fn describe(
    client: &ApiClient,
    kind: &str,
    key: &str,
    namespace: &str,
) -> anyhow::Result<u8> {
    let path = format!("{}/describe", object_path(kind, key, namespace));
    let reply = client.get(&path).await?;
    finish(&reply)
}

/// List a kind, as JSON or one `namespace/name` line per object.
pub async fn list(client: &ApiClient, kind: &str, json: bool) -> anyhow::Result<u8> {
    let reply = client.get(&format!("/api/v1/{kind}")).await?;
    if json || !reply.is_success() {
        return finish(&reply);
    }
    for line in summarize(reply.data()) {
        println!("{line}");
    }
    Ok(exit_code(&reply))
}

fn summarize(items: &Value) -> Vec<String> {
    let Some(items) = items.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| {
            let ns = item["namespace"].as_str().unwrap_or("?");
            let name = item["name"].as_str().unwrap_or("?");
            match item["generation"].as_u64() {
                Some(generation) => format!("{ns}/{name}\tgeneration={generation}"),
                None => format!("{ns}/{name}"),
            }
        })
        .collect()
}
