pub mod apply;
pub mod delete;
pub mod get;
pub mod watch;

use shoal_api::exit_code_for_status;

use crate::client::Reply;

/// Split `ns/name`, falling back to `namespace` for a bare name.
pub fn object_path(kind: &str, key: &str, namespace: &str) -> String {
    match key.split_once('/') {
        Some((ns, name)) => format!("/api/v1/{kind}/{ns}/{name}"),
        None => format!("/api/v1/{kind}/{namespace}/{key}"),
    }
}

/// Print the reply and map its status to the process exit code.
pub fn finish(reply: &Reply) -> anyhow::Result<u8> {
    if reply.is_success() {
        println!("{}", serde_json::to_string_pretty(reply.data())?);
    } else {
        eprintln!("error: {}", reply.error());
    }
    Ok(exit_code(reply))
}

pub fn exit_code(reply: &Reply) -> u8 {
    u8::try_from(exit_code_for_status(reply.status)).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_accepts_qualified_and_bare_keys() {
        assert_eq!(
            object_path("workload", "prod/web", "default"),
            "/api/v1/workload/prod/web"
        );
        assert_eq!(
            object_path("route", "web", "default"),
            "/api/v1/route/default/web"
        );
    }
}
