//! Instance template hashing.

use sha2::{Digest, Sha256};

use crate::types::InstanceTemplate;

/// Number of hex characters kept from the digest.
const HASH_LEN: usize = 16;

/// Compute the template hash for an instance template.
///
/// The template serializes deterministically (env and config data are
/// `BTreeMap`s), so equal templates always hash equally.
pub fn template_hash(template: &InstanceTemplate) -> String {
    let canonical = serde_json::to_vec(template).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AppliedConfig, InstanceTemplate};
    use std::collections::BTreeMap;

    fn template() -> InstanceTemplate {
        InstanceTemplate {
            command: "/usr/bin/dashboard".to_string(),
            args: vec!["--serve".to_string()],
            port: 8080,
            resources: Default::default(),
            env: BTreeMap::from([("MODE".to_string(), "prod".to_string())]),
            config: None,
        }
    }

    #[test]
    fn hash_is_stable_and_short() {
        let a = template_hash(&template());
        let b = template_hash(&template());
        assert_eq!(a, b);
        assert_eq!(a.len(), HASH_LEN);
    }

    #[test]
    fn config_version_changes_hash() {
        let base = template();
        let mut with_config = template();
        with_config.config = Some(AppliedConfig {
            name: "web-config".to_string(),
            version_id: "v2".to_string(),
            data: BTreeMap::new(),
        });
        assert_ne!(template_hash(&base), template_hash(&with_config));
    }
}
