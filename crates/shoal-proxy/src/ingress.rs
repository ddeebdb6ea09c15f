//! Ingress dispatch: host + path prefix to workload.
//!
//! Hosts match exactly (case-insensitive, port stripped). Among the rules
//! for a host the longest matching prefix wins, and prefixes match whole
//! path segments: `/api` matches `/api` and `/api/v1` but not `/apiary`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use shoal_state::{Route, WorkloadId};

use crate::error::{RouteError, RouteResult};
use crate::router::{Lease, ServiceRouter};

#[derive(Debug, Clone)]
struct PrefixRule {
    prefix: String,
    target: WorkloadId,
    route: String,
}

/// Immutable host → prefix rules lookup built from Route objects.
#[derive(Debug, Default)]
pub struct RouteTable {
    hosts: HashMap<String, Vec<PrefixRule>>,
}

impl RouteTable {
    /// Build a table. On duplicate host + prefix the route with the
    /// lowest `{namespace}/{name}` key wins.
    pub fn from_routes(routes: &[Route]) -> Self {
        let mut sorted: Vec<&Route> = routes.iter().collect();
        sorted.sort_by_key(|r| r.table_key());

        let mut hosts: HashMap<String, Vec<PrefixRule>> = HashMap::new();
        for route in sorted {
            let host = normalize_host(&route.host_pattern);
            let prefix = normalize_prefix(&route.path_prefix);
            let rules = hosts.entry(host.clone()).or_default();
            if let Some(existing) = rules.iter().find(|r| r.prefix == prefix) {
                warn!(
                    route = %route.table_key(),
                    shadowed_by = %existing.route,
                    host = %host,
                    prefix = %prefix,
                    "duplicate ingress rule ignored"
                );
                continue;
            }
            rules.push(PrefixRule {
                prefix,
                target: route.target_id(),
                route: route.table_key(),
            });
        }
        for rules in hosts.values_mut() {
            rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        }
        Self { hosts }
    }

    /// Resolve a request to its target workload.
    pub fn resolve(&self, host: &str, path: &str) -> RouteResult<&WorkloadId> {
        let not_found = || RouteError::NotFound {
            host: host.to_string(),
            path: path.to_string(),
        };
        let rules = self.hosts.get(&normalize_host(host)).ok_or_else(not_found)?;
        rules
            .iter()
            .find(|r| prefix_matches(&r.prefix, path))
            .map(|r| &r.target)
            .ok_or_else(not_found)
    }

    pub fn len(&self) -> usize {
        self.hosts.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Ingress layer in front of the service router.
pub struct Ingress {
    table: RwLock<Arc<RouteTable>>,
    router: Arc<ServiceRouter>,
}

impl Ingress {
    pub fn new(router: Arc<ServiceRouter>) -> Self {
        Self {
            table: RwLock::new(Arc::new(RouteTable::default())),
            router,
        }
    }

    /// Replace the route table.
    pub fn reload(&self, routes: &[Route]) {
        let table = RouteTable::from_routes(routes);
        info!(rules = table.len(), "ingress routes loaded");
        *self.table.write().expect("ingress lock") = Arc::new(table);
    }

    /// Target workload for a host and path.
    pub fn resolve(&self, host: &str, path: &str) -> RouteResult<WorkloadId> {
        let table = self.table.read().expect("ingress lock").clone();
        table.resolve(host, path).cloned()
    }

    /// Resolve and lease an endpoint of the target workload.
    pub fn route(&self, host: &str, path: &str) -> RouteResult<Lease> {
        let workload = self.resolve(host, path)?;
        self.router.route(&workload)
    }

    pub fn router(&self) -> &Arc<ServiceRouter> {
        &self.router
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    // Bracketed IPv6 literals keep their colons.
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        host.split(':').next().unwrap_or(host)
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
