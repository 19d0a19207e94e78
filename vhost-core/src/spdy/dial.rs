//! The external boundary: turning a pod name into an upgraded
//! port-forward session. Everything past the upgrade handshake — request
//! multiplexing, the byte forwarder — lives in [`super::Connection`] and
//! knows nothing about Kubernetes.

use std::io;
use std::sync::Arc;

use kube::api::Portforwarder;
use kube::{Api, Client};
use tokio::sync::Mutex;

use crate::error::DialError;
use crate::spdy::{Connection, Stream, StreamConnection, StreamHeaders, StreamType};

/// Performs the upgrade to the `portforward.k8s.io` subprotocol for a
/// pod and hands back a [`Connection`] ready to multiplex forwards over
/// it. Implementations never retry internally; [`crate::backend::PodBackend`]
/// is responsible for calling this at most once per pod.
#[async_trait::async_trait]
pub trait PortForwardDialer: Send + Sync {
    async fn dial(&self, namespace: &str, pod_name: &str) -> Result<Connection, DialError>;
}

/// Production dialer backed by a `kube::Client`.
///
/// `kube`'s own [`Portforwarder`] hands back one stream per port for its
/// own session lifetime, not a fresh pair per logical request the way
/// `port_forward_resolver.go` multiplexes over one SPDY upgrade. Rather
/// than fold many logical streams onto one `Portforwarder` (which would
/// starve every forward past the first, since each stream can only be
/// taken once), this dialer opens a fresh `Portforwarder` per
/// `create_stream` call on a data stream, mirroring the original's
/// per-request `DialPortForwardConnection`. The error stream is
/// synthesized as always-empty, since `kube` reports failures by
/// closing the stream rather than via a sibling error stream.
pub struct KubePortForwardDialer {
    client: Client,
}

impl KubePortForwardDialer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl PortForwardDialer for KubePortForwardDialer {
    async fn dial(&self, namespace: &str, pod_name: &str) -> Result<Connection, DialError> {
        let api: Api<k8s_openapi::api::core::v1::Pod> =
            Api::namespaced(self.client.clone(), namespace);

        Ok(Connection::new(Arc::new(PerRequestStreamConnection {
            api,
            pod_name: pod_name.to_string(),
            forwarders: Mutex::new(Vec::new()),
        })))
    }
}

struct PerRequestStreamConnection {
    api: Api<k8s_openapi::api::core::v1::Pod>,
    pod_name: String,
    forwarders: Mutex<Vec<Portforwarder>>,
}

#[async_trait::async_trait]
impl StreamConnection for PerRequestStreamConnection {
    async fn create_stream(&self, headers: StreamHeaders) -> io::Result<Box<dyn Stream>> {
        if matches!(headers.stream_type, StreamType::Error) {
            let (empty, _keep_alive) = tokio::io::duplex(1);
            return Ok(Box::new(empty));
        }

        let mut forwarder = self
            .api
            .portforward(&self.pod_name, &[headers.port])
            .await
            .map_err(io::Error::other)?;
        let stream = forwarder
            .take_stream(headers.port)
            .ok_or_else(|| io::Error::other(format!("port {} stream unavailable", headers.port)))?;

        self.forwarders.lock().await.push(forwarder);
        Ok(Box::new(stream))
    }

    async fn closed(&self) {
        let mut forwarders = self.forwarders.lock().await;
        for forwarder in forwarders.iter_mut() {
            let _ = forwarder.join().await;
        }
    }

    async fn close(&self) -> io::Result<()> {
        let mut forwarders = self.forwarders.lock().await;
        for forwarder in forwarders.iter_mut() {
            forwarder.abort().map_err(io::Error::other)?;
        }
        Ok(())
    }
}
