//! Shoal service routing: endpoint registry, load balancing, ingress dispatch.
//!
//! This crate makes an instance pool usable while it changes shape.
//!
//! # Components
//!
//! - **`registry`**: Live, health-flagged endpoints with atomic snapshots
//! - **`balancer`**: Round-robin and least-outstanding-connections selection
//! - **`router`**: Service-layer selection over a workload's healthy endpoints
//! - **`ingress`**: Host/path dispatch to the right workload
//! - **`server`**: HTTP forwarding server in front of the ingress
//!
//! ```text
//! external caller ──▶ ProxyServer ──▶ Ingress (host, longest prefix)
//!                                        │
//!                                        ▼
//!                     ServiceRouter ──▶ EndpointRegistry::list_healthy()
//! ```

pub mod balancer;
pub mod error;
pub mod ingress;
pub mod registry;
pub mod router;
pub mod server;

pub use balancer::{BalanceStrategy, RoundRobinBalancer};
pub use error::{RouteError, RouteResult};
pub use ingress::{Ingress, RouteTable};
pub use registry::{Endpoint, EndpointRegistry, RegistrySnapshot};
pub use router::{Lease, ServiceRouter};
pub use server::ProxyServer;
