//! Thin helpers over `k8s-openapi`/`kube` types.
//!
//! These are the only places this crate reaches into the cluster object
//! model directly; everything else in `vhost_core` works in terms of the
//! derived [`crate::entry::ServicePortEntry`] / [`crate::matched_pod::MatchedPod`]
//! values.

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::core::Selector;

/// A pod is ready iff it carries a `Ready` status condition with status
/// `"True"`. Mirrors `k8s.io/kubectl/pkg/util/podutils.IsPodReady`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    let Some(conditions) = &status.conditions else {
        return false;
    };
    conditions
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

/// Builds the selector a `Service` uses to pick its backing pods from its
/// `spec.selector` map. A service with no selector (e.g. headless services
/// pointed at an external name) has no usable routing key.
pub fn selector_for_service(service: &Service) -> Option<Selector> {
    let map = service.spec.as_ref()?.selector.as_ref()?;
    if map.is_empty() {
        return None;
    }
    let expr = map
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    expr.parse().ok()
}

/// Evaluates a selector against a pod's labels.
pub fn selector_matches(selector: &Selector, pod: &Pod) -> bool {
    let labels = pod
        .metadata
        .labels
        .clone()
        .unwrap_or_default();
    selector.matches(&labels)
}
