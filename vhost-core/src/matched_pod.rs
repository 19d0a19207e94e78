//! `MatchedPod`: a pod observed to satisfy some [`crate::entry::ServicePortEntry`]'s
//! selector, resolved down to the fields the backend layer actually needs.

use crate::entry::TargetPort;
use crate::k8s;
use k8s_openapi::api::core::v1::Pod;

/// A pod, projected down to what `backend.rs` needs to dial and forward.
#[derive(Debug, Clone)]
pub struct MatchedPod {
    name: String,
    namespace: String,
    ready: bool,
    target_port: u16,
}

impl MatchedPod {
    /// Resolves the entry's target port against the pod: a non-zero
    /// numeric `targetPort` is used as-is; a named `targetPort` is
    /// parsed as a decimal integer; if that parse fails, the entry's
    /// own service port is used instead.
    pub fn resolve(pod: &Pod, target_port: &TargetPort, service_port: u16) -> Option<Self> {
        let name = pod.metadata.name.clone()?;
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let ready = k8s::is_pod_ready(pod);

        let port = match target_port {
            TargetPort::Number(n) if *n != 0 => *n,
            TargetPort::Number(_) => service_port,
            TargetPort::Name(port_name) => port_name.parse().unwrap_or(service_port),
        };

        Some(Self {
            name,
            namespace,
            ready,
            target_port: port,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Identity key used to tell two snapshots of the same pod apart from
    /// two different pods: namespace-qualified name, since pod names are
    /// only unique within a namespace.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ready_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn numeric_target_port_passes_through() {
        let pod = ready_pod("web-1");
        let matched = MatchedPod::resolve(&pod, &TargetPort::Number(8080), 80).unwrap();
        assert_eq!(matched.target_port(), 8080);
        assert!(matched.ready());
        assert_eq!(matched.key(), "default/web-1");
    }

    #[test]
    fn named_target_port_parsed_as_decimal() {
        let pod = ready_pod("web-1");
        let matched =
            MatchedPod::resolve(&pod, &TargetPort::Name("9090".to_string()), 80).unwrap();
        assert_eq!(matched.target_port(), 9090);
    }

    #[test]
    fn unparseable_named_port_falls_back_to_service_port() {
        let pod = ready_pod("web-1");
        let matched =
            MatchedPod::resolve(&pod, &TargetPort::Name("http".to_string()), 80).unwrap();
        assert_eq!(matched.target_port(), 80);
    }

    #[test]
    fn zero_numeric_target_port_falls_back_to_service_port() {
        let pod = ready_pod("web-1");
        let matched = MatchedPod::resolve(&pod, &TargetPort::Number(0), 80).unwrap();
        assert_eq!(matched.target_port(), 80);
    }
}
