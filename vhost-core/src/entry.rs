//! `ServicePortEntry`: an immutable binding of one service port to the
//! selector that picks its backing pods.

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::core::Selector;

use crate::k8s;

/// A service's `targetPort`, which the API lets users spell as either a
/// number or a named container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPort {
    Number(u16),
    Name(String),
}

/// One port entry of one service, together with the selector that decides
/// which pods may serve it. Append-only once indexed in a [`crate::router::ServicePortRouter`].
#[derive(Debug, Clone)]
pub struct ServicePortEntry {
    service_name: String,
    port: u16,
    port_name: Option<String>,
    target_port: TargetPort,
    selector: Selector,
}

impl ServicePortEntry {
    pub fn new(
        service_name: impl Into<String>,
        port: u16,
        port_name: Option<String>,
        target_port: TargetPort,
        selector: Selector,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            port,
            port_name,
            target_port,
            selector,
        }
    }

    /// Builds every resolvable entry for a `Service`. A port is skipped if
    /// neither its numeric `targetPort` nor its own `port` is usable; the
    /// whole service is skipped if it carries no selector. Both failures
    /// are silent: a partial service definition must not crash the proxy.
    pub fn for_service(service: &Service) -> Vec<Self> {
        let Some(selector) = k8s::selector_for_service(service) else {
            return Vec::new();
        };
        let name = service.metadata.name.clone().unwrap_or_default();
        let Some(spec) = &service.spec else {
            return Vec::new();
        };
        let Some(ports) = &spec.ports else {
            return Vec::new();
        };

        ports
            .iter()
            .filter_map(|svc_port| {
                let target_port = match &svc_port.target_port {
                    Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(n))
                        if *n > 0 =>
                    {
                        Some(TargetPort::Number(*n as u16))
                    }
                    Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(s))
                        if !s.is_empty() =>
                    {
                        Some(TargetPort::Name(s.clone()))
                    }
                    _ if svc_port.port > 0 => Some(TargetPort::Number(svc_port.port as u16)),
                    _ => None,
                }?;

                Some(ServicePortEntry::new(
                    name.clone(),
                    svc_port.port as u16,
                    svc_port.name.clone(),
                    target_port,
                    selector.clone(),
                ))
            })
            .collect()
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    pub fn target_port(&self) -> &TargetPort {
        &self.target_port
    }

    /// What clients dial: `"<serviceName>:<port>"`.
    pub fn source_host_port(&self) -> String {
        format!("{}:{}", self.service_name, self.port)
    }

    /// A hostname-only alias for clients that cannot present a port:
    /// `"<serviceName>-<port>"`.
    pub fn source_host_name(&self) -> String {
        format!("{}-{}", self.service_name, self.port)
    }

    /// Informational target address, used when no live pod backend exists.
    pub fn target_host_port(&self) -> String {
        let port = match &self.target_port {
            TargetPort::Number(n) => n.to_string(),
            TargetPort::Name(s) => s.clone(),
        };
        format!("{}:{}", self.service_name, port)
    }

    /// Whether `pod` is selected by this entry's label selector.
    pub fn matches(&self, pod: &Pod) -> bool {
        k8s::selector_matches(&self.selector, pod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use std::collections::BTreeMap;

    fn service(name: &str, ports: Vec<ServicePort>) -> Service {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), name.to_string());
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn derived_addresses() {
        let svc = service(
            "web",
            vec![ServicePort {
                port: 80,
                target_port: Some(IntOrString::Int(8080)),
                ..Default::default()
            }],
        );
        let entries = ServicePortEntry::for_service(&svc);
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.source_host_port(), "web:80");
        assert_eq!(entry.source_host_name(), "web-80");
        assert_eq!(entry.target_host_port(), "web:8080");
    }

    #[test]
    fn falls_back_to_service_port_when_target_port_unset() {
        let svc = service(
            "api",
            vec![ServicePort {
                port: 81,
                ..Default::default()
            }],
        );
        let entries = ServicePortEntry::for_service(&svc);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target_host_port(), "api:81");
    }

    #[test]
    fn service_without_selector_is_dropped() {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("headless".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(ServicePortEntry::for_service(&svc).is_empty());
    }

    #[test]
    fn matches_uses_selector() {
        let svc = service(
            "web",
            vec![ServicePort {
                port: 80,
                ..Default::default()
            }],
        );
        let entry = &ServicePortEntry::for_service(&svc)[0];

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        let pod = Pod {
            metadata: ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        };
        assert!(entry.matches(&pod));
    }
}
