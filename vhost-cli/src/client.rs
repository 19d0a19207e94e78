//! Thin wrapper over the `kube` client: everything this crate needs to
//! know about talking to the API server lives here, mirroring the
//! narrow `kube.GetClient` / `kube.GetPodList` / `kube.GetPodWatcher`
//! helpers this proxy is built around.

use std::path::PathBuf;

use futures::Stream;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("reading kubeconfig: {0}")]
    ReadKubeconfig(#[source] kube::config::KubeconfigError),

    #[error("resolving kube config: {0}")]
    InferConfig(#[source] kube::config::InferConfigError),

    #[error("building client: {0}")]
    BuildClient(#[source] kube::Error),

    #[error("listing {kind}: {source}")]
    List {
        kind: &'static str,
        #[source]
        source: kube::Error,
    },

    #[error("watching pods: {0}")]
    Watch(#[source] kube::Error),
}

/// Builds a cluster client and returns it alongside the active context's
/// default namespace, so a caller that was given no `--namespace` can
/// fall back to whatever the operator's kubeconfig already points at.
pub async fn build_client(kubeconfig: Option<PathBuf>) -> Result<(Client, String), ClientError> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(ClientError::ReadKubeconfig)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(ClientError::ReadKubeconfig)?
        }
        None => Config::infer().await.map_err(ClientError::InferConfig)?,
    };

    let default_namespace = config.default_namespace.clone();
    let client = Client::try_from(config).map_err(ClientError::BuildClient)?;
    Ok((client, default_namespace))
}

pub async fn list_services(
    client: &Client,
    namespace: &str,
    selector: Option<&str>,
) -> Result<Vec<Service>, ClientError> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let params = list_params(selector);
    let list = api
        .list(&params)
        .await
        .map_err(|source| ClientError::List { kind: "services", source })?;
    Ok(list.items)
}

/// Returns the matching pods and the list's resource version, so the
/// caller can start a watch exactly where this snapshot left off.
pub async fn list_pods(
    client: &Client,
    namespace: &str,
    selector: Option<&str>,
) -> Result<(Vec<Pod>, String), ClientError> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = list_params(selector);
    let list = api
        .list(&params)
        .await
        .map_err(|source| ClientError::List { kind: "pods", source })?;
    let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
    Ok((list.items, resource_version))
}

pub async fn watch_pods(
    client: &Client,
    namespace: &str,
    selector: Option<&str>,
    resource_version: &str,
) -> Result<impl Stream<Item = Result<WatchEvent<Pod>, kube::Error>>, ClientError> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let mut params = WatchParams::default();
    if let Some(selector) = selector {
        params = params.labels(selector);
    }
    api.watch(&params, resource_version)
        .await
        .map_err(ClientError::Watch)
}

fn list_params(selector: Option<&str>) -> ListParams {
    match selector {
        Some(selector) => ListParams::default().labels(selector),
        None => ListParams::default(),
    }
}
