mod client;
mod config;
mod logging;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::api::WatchEvent;
use tokio::sync::Notify;
use vhost_core::resolver::Resolver;
use vhost_core::spdy::dial::KubePortForwardDialer;

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    logging::init(config.verbose);

    let (kube_client, default_namespace) = client::build_client(config.kubeconfig.clone()).await?;
    let namespace = config.namespace.clone().unwrap_or(default_namespace);
    let selector = config.selector.clone();

    let resolver = Arc::new(build_resolver(config.verbose));

    let services = client::list_services(&kube_client, &namespace, selector.as_deref()).await?;
    for service in &services {
        resolver.add_service(service);
    }

    let (pods, resource_version) =
        client::list_pods(&kube_client, &namespace, selector.as_deref()).await?;
    for pod in &pods {
        resolver.add_pod(pod);
    }

    for entry in resolver.list_services() {
        tracing::info!(
            vhost = %entry.source_host_name(),
            svc = %entry.source_host_port(),
            "vhost port-forward svc/{} -> {}",
            entry.source_host_port(),
            entry.source_host_name(),
        );
    }

    let watch_resolver = resolver.clone();
    let watch_client = kube_client.clone();
    let watch_namespace = namespace.clone();
    let watch_selector = selector.clone();
    let verbose = config.verbose;
    let watch_ended = Arc::new(Notify::new());
    let watch_ended_signal = watch_ended.clone();

    tokio::spawn(async move {
        let mut stream = match client::watch_pods(
            &watch_client,
            &watch_namespace,
            watch_selector.as_deref(),
            &resource_version,
        )
        .await
        {
            Ok(stream) => Box::pin(stream),
            Err(err) => {
                tracing::error!(%err, "starting pod watch");
                watch_ended_signal.notify_waiters();
                return;
            }
        };

        while let Some(event) = stream.next().await {
            let pod = match event {
                Ok(WatchEvent::Added(pod) | WatchEvent::Modified(pod)) => pod,
                Ok(WatchEvent::Deleted(pod)) => {
                    if let Some(name) = pod.metadata.name.clone() {
                        watch_resolver.delete_by_name(&name);
                    }
                    continue;
                }
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(%err, "pod watch event");
                    continue;
                }
            };

            if verbose {
                tracing::debug!(pod = ?pod.metadata.name, "pod event");
            }
            watch_resolver.update_pod(&pod);
        }

        tracing::warn!("pod watch stream ended");
        watch_ended_signal.notify_waiters();
    });

    let dialer = Arc::new(KubePortForwardDialer::new(kube_client));
    let addr = SocketAddr::new(config.address, config.port);
    let server = server::Server::new(resolver, dialer, namespace);
    server.serve(addr, shutdown_signal(watch_ended)).await?;

    Ok(())
}

/// Resolves on `SIGINT`, `SIGTERM` (unix only), or the pod watch stream
/// ending — whichever comes first.
async fn shutdown_signal(watch_ended: Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT"),
            _ = terminate.recv() => tracing::info!("received SIGTERM"),
            _ = watch_ended.notified() => tracing::warn!("pod watch ended, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT"),
            _ = watch_ended.notified() => tracing::warn!("pod watch ended, shutting down"),
        }
    }
}

fn build_resolver(verbose: bool) -> Resolver {
    Resolver::new().with_backend_callback(Arc::new(move |entry, backend| {
        let source_host_name = entry.source_host_name();
        let target_host_port = backend.target_host_port();
        if verbose {
            tracing::info!(%source_host_name, %target_host_port, "add service backend");
        }
    }))
}
