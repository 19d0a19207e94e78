//! Pod-level and service-level backend bookkeeping: which pods currently
//! back a routing entry, and the one-shot port-forward dial latch each
//! pod backend owns.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::OnceCell;

use crate::entry::ServicePortEntry;
use crate::error::DialError;
use crate::matched_pod::MatchedPod;
use crate::spdy::dial::PortForwardDialer;
use crate::spdy::Connection;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// A single candidate pod for a routing entry, and the (at most one)
/// live port-forward connection dialed to it.
///
/// Dialing happens at most once per backend no matter how many callers
/// race to resolve it concurrently: the first caller performs the dial,
/// every other caller awaits the same [`OnceCell`] and receives the same
/// result — success or failure — without redialing.
pub struct PodBackend {
    matched_pod: MatchedPod,
    dial_result: OnceCell<Result<Arc<Connection>, DialError>>,
    on_create_port_forward: Option<Callback>,
    on_close_port_forward: Option<Callback>,
}

impl PodBackend {
    pub fn new(matched_pod: MatchedPod) -> Self {
        Self {
            matched_pod,
            dial_result: OnceCell::new(),
            on_create_port_forward: None,
            on_close_port_forward: None,
        }
    }

    pub fn with_callbacks(
        mut self,
        on_create_port_forward: Option<Callback>,
        on_close_port_forward: Option<Callback>,
    ) -> Self {
        self.on_create_port_forward = on_create_port_forward;
        self.on_close_port_forward = on_close_port_forward;
        self
    }

    pub fn name(&self) -> &str {
        self.matched_pod.name()
    }

    pub fn matched_pod(&self) -> &MatchedPod {
        &self.matched_pod
    }

    pub fn target_host_port(&self) -> String {
        format!("{}:{}", self.matched_pod.name(), self.matched_pod.target_port())
    }

    /// Dials a port-forward connection to this pod on first call; every
    /// later call, concurrent or not, observes the same outcome.
    pub async fn dial_port_forward_once(
        &self,
        dialer: &dyn PortForwardDialer,
        namespace: &str,
    ) -> Result<Arc<Connection>, DialError> {
        let result = self
            .dial_result
            .get_or_init(|| async {
                let outcome = dialer
                    .dial(namespace, self.matched_pod.name())
                    .await
                    .map(Arc::new);

                if let Ok(connection) = &outcome {
                    if let Some(cb) = &self.on_create_port_forward {
                        cb();
                    }
                    if let Some(cb) = self.on_close_port_forward.clone() {
                        let connection = connection.clone();
                        tokio::spawn(async move {
                            connection.closed().await;
                            cb();
                        });
                    }
                }
                outcome
            })
            .await;

        result.clone()
    }

    pub async fn close(&self) {
        if let Some(Ok(connection)) = self.dial_result.get() {
            connection.close().await;
        }
    }
}

/// The set of pod backends currently known for one routing entry.
#[derive(Default)]
pub struct PodBackendSet {
    pods: RwLock<Vec<Arc<PodBackend>>>,
}

impl PodBackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, backend: Arc<PodBackend>) {
        self.pods.write().push(backend);
    }

    pub fn delete_by_name(&self, pod_name: &str) {
        self.pods.write().retain(|b| b.name() != pod_name);
    }

    /// Picks an arbitrary live backend. Callers don't need load balancing
    /// semantics here — one developer's proxy, one connection at a time
    /// per service is the common case.
    pub fn get_one(&self) -> Option<Arc<PodBackend>> {
        self.pods.read().first().cloned()
    }

    pub fn len(&self) -> usize {
        self.pods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps each routing entry to the set of pod backends currently serving
/// it. Keyed by the entry's `host:port` address rather than by pointer,
/// since Rust entries don't need pointer identity to be distinguishable.
#[derive(Default)]
pub struct ServiceBackend {
    sets: RwLock<HashMap<String, Arc<PodBackendSet>>>,
}

impl ServiceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: &ServicePortEntry, backend: Arc<PodBackend>) {
        let key = entry.source_host_port();
        let set = self
            .sets
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(PodBackendSet::new()))
            .clone();
        set.add(backend);
    }

    pub fn get(&self, entry: &ServicePortEntry) -> Option<Arc<PodBackendSet>> {
        self.sets.read().get(&entry.source_host_port()).cloned()
    }

    pub fn get_one(&self, entry: &ServicePortEntry) -> Option<Arc<PodBackend>> {
        self.get(entry).and_then(|set| set.get_one())
    }

    /// Removes `pod_name` from every entry's backend set, e.g. on pod
    /// deletion or the pod falling out of readiness.
    pub fn delete_by_name(&self, pod_name: &str) {
        for set in self.sets.read().values() {
            set.delete_by_name(pod_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::TargetPort;
    use kube::core::Selector;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingDialer {
        attempts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PortForwardDialer for FailingDialer {
        async fn dial(&self, _namespace: &str, _pod_name: &str) -> Result<Connection, DialError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DialError::Upgrade("refused".to_string()))
        }
    }

    #[tokio::test]
    async fn dial_failure_is_sticky_until_backend_is_replaced() {
        let dialer = FailingDialer { attempts: AtomicUsize::new(0) };
        let backend = backend("web-1");

        let first = backend.dial_port_forward_once(&dialer, "default").await;
        let second = backend.dial_port_forward_once(&dialer, "default").await;

        assert!(first.is_err());
        assert!(second.is_err());
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 1);

        // A fresh backend (as created after `delete_by_name` + a new
        // `add_pod`) dials again rather than inheriting the old latch.
        let replacement = backend("web-1");
        let third = replacement.dial_port_forward_once(&dialer, "default").await;
        assert!(third.is_err());
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 2);
    }

    fn entry(name: &str, port: u16) -> ServicePortEntry {
        ServicePortEntry::new(name, port, None, TargetPort::Number(port), Selector::default())
    }

    fn backend(name: &str) -> Arc<PodBackend> {
        Arc::new(PodBackend::new(crate::matched_pod::MatchedPod::resolve(
            &k8s_openapi::api::core::v1::Pod {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some("default".to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::core::v1::PodSpec::default()),
                ..Default::default()
            },
            &TargetPort::Number(8080),
            8080,
        )
        .unwrap()))
    }

    #[test]
    fn pod_backend_set_tracks_membership() {
        let set = PodBackendSet::new();
        assert!(set.is_empty());
        set.add(backend("a"));
        set.add(backend("b"));
        assert_eq!(set.len(), 2);
        set.delete_by_name("a");
        assert_eq!(set.len(), 1);
        assert_eq!(set.get_one().unwrap().name(), "b");
    }

    #[test]
    fn service_backend_indexes_by_entry_address() {
        let svc = ServiceBackend::new();
        let e = entry("web", 80);
        svc.add(&e, backend("web-1"));
        assert_eq!(svc.get_one(&e).unwrap().name(), "web-1");

        svc.delete_by_name("web-1");
        assert!(svc.get_one(&e).is_none());
    }
}
