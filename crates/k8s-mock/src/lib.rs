//! Mock Kubernetes API server for testing.
//!
//! Provides an HTTP server that can be used with kubeconfig-based connections.
//! Objects are kept in memory; create, get, list, patch (merge and strategic),
//! replace and delete behave like the real API server closely enough
//! to exercise client-side reconciliation logic. Write conflicts and read
//! failures can be injected per object name.

pub mod discovery;
mod helpers;
pub mod http;

pub use discovery::{DiscoveryMode, MockApiResource, MockDiscovery};
pub use http::{HttpMockK8sServer, RunningHttpMockK8sServer};
