//! Backend registry: isolation-name -> backend lookup, plus the fixed
//! runtime -> isolation auto-routing table.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Backend, Capabilities};
use crate::domain::{Isolation, Runtime};
use crate::error::{Result, VulcanError};

/// Fixed auto-routing table: `isolation == auto` substitutes via this list.
const AUTO_ROUTES: &[(Runtime, Isolation)] = &[
    (Runtime::Node, Isolation::Isolate),
    (Runtime::Wasm, Isolation::Isolate),
    (Runtime::Go, Isolation::Microvm),
    (Runtime::Python, Isolation::Microvm),
    (Runtime::Oci, Isolation::Gvisor),
];

/// Maps isolation names to registered backends and resolves `auto` requests.
#[derive(Default, Clone)]
pub struct Registry {
    backends: HashMap<Isolation, Arc<dyn Backend>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register `backend` under `isolation`. A later call with the same
    /// isolation replaces the previous registration.
    pub fn register(&mut self, isolation: Isolation, backend: Arc<dyn Backend>) {
        self.backends.insert(isolation, backend);
    }

    /// Resolve `(isolation, runtime)` to a registered backend, substituting
    /// through the auto-routing table when `isolation == Isolation::Auto`.
    ///
    /// # Errors
    ///
    /// `VulcanError::NotFound` if no backend is registered for the resolved
    /// isolation.
    pub fn resolve(&self, isolation: Isolation, runtime: Runtime) -> Result<Arc<dyn Backend>> {
        let resolved = if isolation == Isolation::Auto {
            AUTO_ROUTES
                .iter()
                .find(|(rt, _)| *rt == runtime)
                .map(|(_, iso)| *iso)
                .ok_or_else(|| {
                    VulcanError::NotFound(format!("no auto-route for runtime {runtime}"))
                })?
        } else {
            isolation
        };

        self.backends
            .get(&resolved)
            .cloned()
            .ok_or_else(|| VulcanError::NotFound(format!("no backend for isolation {resolved}")))
    }

    /// Registered backends' capabilities, ordered by name for stable API
    /// responses. `auto` is never listed; it is a client-side selector
    /// resolved here, not a registrable backend.
    #[must_use]
    pub fn list(&self) -> Vec<Capabilities> {
        let mut caps: Vec<Capabilities> = self.backends.values().map(|b| b.capabilities()).collect();
        caps.sort_by(|a, b| a.name.cmp(&b.name));
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecutionResult, WorkloadSpec};
    use async_trait::async_trait;

    struct StubBackend {
        name: &'static str,
        isolations: Vec<Isolation>,
    }

    #[async_trait]
    impl Backend for StubBackend {
        async fn execute(&self, _spec: WorkloadSpec) -> Result<ExecutionResult> {
            Ok(ExecutionResult::default())
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                name: self.name.to_string(),
                supported_runtimes: vec![],
                supported_isolations: self.isolations.clone(),
                max_concurrency: 1,
            }
        }
        async fn cleanup(&self, _workload_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn registry_with(name: &'static str, isolation: Isolation) -> Registry {
        let mut registry = Registry::new();
        registry.register(
            isolation,
            Arc::new(StubBackend {
                name,
                isolations: vec![isolation],
            }),
        );
        registry
    }

    #[test]
    fn auto_routes_node_to_isolate() {
        let registry = registry_with("isolate-backend", Isolation::Isolate);
        let backend = registry.resolve(Isolation::Auto, Runtime::Node).unwrap();
        assert_eq!(backend.capabilities().name, "isolate-backend");
    }

    #[test]
    fn auto_routes_python_to_microvm() {
        let registry = registry_with("microvm-backend", Isolation::Microvm);
        let backend = registry.resolve(Isolation::Auto, Runtime::Python).unwrap();
        assert_eq!(backend.capabilities().name, "microvm-backend");
    }

    #[test]
    fn auto_routes_oci_to_gvisor() {
        let registry = registry_with("gvisor-backend", Isolation::Gvisor);
        let backend = registry.resolve(Isolation::Auto, Runtime::Oci).unwrap();
        assert_eq!(backend.capabilities().name, "gvisor-backend");
    }

    #[test]
    fn explicit_isolation_bypasses_auto_routing() {
        let registry = registry_with("microvm-backend", Isolation::Microvm);
        let backend = registry
            .resolve(Isolation::Microvm, Runtime::Node)
            .unwrap();
        assert_eq!(backend.capabilities().name, "microvm-backend");
    }

    #[test]
    fn unregistered_isolation_is_not_found() {
        let registry = Registry::new();
        let err = registry.resolve(Isolation::Microvm, Runtime::Go).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn list_is_sorted_by_name() {
        let mut registry = Registry::new();
        registry.register(
            Isolation::Microvm,
            Arc::new(StubBackend {
                name: "zzz",
                isolations: vec![Isolation::Microvm],
            }),
        );
        registry.register(
            Isolation::Isolate,
            Arc::new(StubBackend {
                name: "aaa",
                isolations: vec![Isolation::Isolate],
            }),
        );
        let names: Vec<_> = registry.list().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["aaa".to_string(), "zzz".to_string()]);
    }
}
