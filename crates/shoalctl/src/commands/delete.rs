use crate::client::ApiClient;

use super::{exit_code, object_path};

pub async fn delete(client: &ApiClient, kind: &str, key: &str, namespace: &str) -> anyhow::Result<u8> {
    let reply = client.delete(&object_path(kind, key, namespace)).await?;
    if reply.is_success() {
        println!("{kind} {key} deleted");
    } else {
        eprintln!("error: {}", reply.error());
    }
    Ok(exit_code(&reply))
}
