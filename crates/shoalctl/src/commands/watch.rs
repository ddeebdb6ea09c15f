use std::time::Duration;

use crate::client::ApiClient;

use super::{exit_code, object_path};

/// Print the object, then print it again after every change.
///
/// Each request is a server-side long poll of `poll_secs`; `once` stops
/// after the first change.
pub async fn watch(
    client: &ApiClient,
    kind: &str,
    key: &str,
    namespace: &str,
    poll_secs: u64,
    once: bool,
) -> anyhow::Result<u8> {
    let base = format!("{}/watch", object_path(kind, key, namespace));
    // Leave the server room to answer before the client gives up.
    let deadline = Duration::from_secs(poll_secs + 10);
    let mut since: Option<String> = None;

    loop {
        let path = match &since {
            Some(fp) => format!("{base}?since={fp}&timeout={poll_secs}"),
            None => base.clone(),
        };
        let reply = client.get_with_timeout(&path, deadline).await?;
        if !reply.is_success() {
            eprintln!("error: {}", reply.error());
            return Ok(exit_code(&reply));
        }

        let event = reply.data();
        let fingerprint = event["fingerprint"].as_str().unwrap_or_default().to_string();
        if event["changed"].as_bool().unwrap_or(false) {
            println!("{}", serde_json::to_string_pretty(&event["object"])?);
            if once && since.is_some() {
                return Ok(0);
            }
        }
        since = Some(fingerprint);
    }
}
