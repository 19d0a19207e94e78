//! Top-level routing state: services in, ready pods in, live backends
//! out. This is the one type `vhost-cli` talks to.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, Service};
use parking_lot::RwLock;

use crate::backend::{PodBackend, ServiceBackend};
use crate::entry::ServicePortEntry;
use crate::k8s;
use crate::matched_pod::MatchedPod;
use crate::router::ServicePortRouter;

type BackendCallback = Arc<dyn Fn(Arc<ServicePortEntry>, Arc<PodBackend>) + Send + Sync>;

/// Tracks every known pod by name so readiness transitions can be
/// diffed against the last observation, mirroring how the watch loop in
/// `vhost-cli` receives repeated `MODIFIED` events for the same pod.
#[derive(Default)]
struct PodTable {
    pods: RwLock<HashMap<String, Pod>>,
}

impl PodTable {
    fn get(&self, name: &str) -> Option<Pod> {
        self.pods.read().get(name).cloned()
    }

    fn insert_if_absent(&self, name: &str, pod: Pod) -> bool {
        let mut pods = self.pods.write();
        if pods.contains_key(name) {
            return false;
        }
        pods.insert(name.to_string(), pod);
        true
    }

    fn remove(&self, name: &str) {
        self.pods.write().remove(name);
    }
}

/// Resolves virtual hostnames (`<service>:<port>` or `<service>-<port>`)
/// to live pod backends, as services and pods are observed from the
/// cluster watch loop.
#[derive(Default)]
pub struct Resolver {
    router: ServicePortRouter,
    pods: PodTable,
    active_backends: ServiceBackend,
    on_add_service_backend: Option<BackendCallback>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend_callback(mut self, callback: BackendCallback) -> Self {
        self.on_add_service_backend = Some(callback);
        self
    }

    /// Indexes every resolvable port of `service`. Safe to call
    /// repeatedly for the same service; later calls are no-ops for ports
    /// already on record.
    pub fn add_service(&self, service: &Service) {
        for entry in ServicePortEntry::for_service(service) {
            self.router.add_if_not_exists(entry);
        }
    }

    /// Registers a newly-ready pod against every entry whose selector it
    /// satisfies. Pods that are not yet ready are ignored; they become
    /// visible when `update_pod` later observes them turning ready.
    pub fn add_pod(&self, pod: &Pod) {
        let Some(name) = pod.metadata.name.clone() else {
            return;
        };
        if !k8s::is_pod_ready(pod) {
            return;
        }
        if !self.pods.insert_if_absent(&name, pod.clone()) {
            return;
        }

        for entry in self.router.values() {
            if !entry.matches(pod) {
                continue;
            }
            let Some(matched) = MatchedPod::resolve(pod, entry.target_port(), entry.port()) else {
                continue;
            };
            let backend = Arc::new(PodBackend::new(matched));
            self.active_backends.add(&entry, backend.clone());
            if let Some(cb) = &self.on_add_service_backend {
                cb(entry.clone(), backend.clone());
            }
        }
    }

    /// Drops `pod_name` from every entry's backend set and forgets it
    /// was ever observed.
    pub fn delete_by_name(&self, pod_name: &str) {
        self.pods.remove(pod_name);
        self.active_backends.delete_by_name(pod_name);
    }

    /// Reconciles a readiness transition: a pod becoming ready is added,
    /// one becoming unready is removed. No-op if readiness hasn't
    /// changed since the last observation.
    pub fn update_pod(&self, pod: &Pod) {
        let Some(name) = pod.metadata.name.clone() else {
            return;
        };
        let was_known = self.pods.get(&name).is_some();
        let ready = k8s::is_pod_ready(pod);

        if was_known == ready {
            return;
        }

        if !ready {
            self.delete_by_name(&name);
            return;
        }

        self.add_pod(pod);
    }

    /// Resolves a virtual hostname to a live backend, if any is known.
    pub fn resolve_backend(&self, hostname: &str) -> Option<Arc<PodBackend>> {
        let entry = self.router.resolve(hostname)?;
        self.active_backends.get_one(&entry)
    }

    /// Resolves a virtual address to the address a caller should
    /// actually dial: the live backend's pod address if one exists,
    /// otherwise the entry's informational target, otherwise `addr`
    /// itself unchanged for anything this resolver doesn't route.
    ///
    /// Tries `addr` verbatim first (its full `host:port` form); if that
    /// misses, falls back to the host-only alias, so a caller that only
    /// has a bare hostname (no port) still resolves.
    pub fn resolve_addr(&self, addr: &str) -> String {
        let entry = self.router.resolve(addr).or_else(|| {
            let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
            self.router.resolve(host)
        });
        let Some(entry) = entry else {
            return addr.to_string();
        };
        match self.active_backends.get_one(&entry) {
            Some(backend) => backend.target_host_port(),
            None => entry.target_host_port(),
        }
    }

    pub fn list_services(&self) -> Vec<Arc<ServicePortEntry>> {
        self.router.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn service(name: &str) -> Service {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), name.to_string());
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(name: &str, app: &str, ready: bool) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), app.to_string());
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn resolves_once_a_ready_pod_is_added() {
        let resolver = Resolver::new();
        resolver.add_service(&service("web"));
        assert!(resolver.resolve_backend("web:80").is_none());

        resolver.add_pod(&pod("web-1", "web", true));
        let backend = resolver.resolve_backend("web:80").unwrap();
        assert_eq!(backend.name(), "web-1");
    }

    #[test]
    fn unready_pod_is_not_registered() {
        let resolver = Resolver::new();
        resolver.add_service(&service("web"));
        resolver.add_pod(&pod("web-1", "web", false));
        assert!(resolver.resolve_backend("web:80").is_none());
    }

    #[test]
    fn update_pod_transitions_readiness() {
        let resolver = Resolver::new();
        resolver.add_service(&service("web"));
        resolver.add_pod(&pod("web-1", "web", true));
        assert!(resolver.resolve_backend("web:80").is_some());

        resolver.update_pod(&pod("web-1", "web", false));
        assert!(resolver.resolve_backend("web:80").is_none());
    }

    #[test]
    fn resolve_addr_falls_back_to_entry_target() {
        let resolver = Resolver::new();
        resolver.add_service(&service("web"));
        assert_eq!(resolver.resolve_addr("web:80"), "web:80");
        assert_eq!(resolver.resolve_addr("unrelated:1"), "unrelated:1");
    }
}
