//! HTTP/1.1 dial adapter: a `tower` connector that resolves a virtual
//! host to a pod and hands back a duplex pipe splicing straight into
//! its port-forward data stream, for use as a `hyper` client's
//! transport in place of a TCP dialer.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper_util::rt::TokioIo;
use tokio::io::duplex;
use tower_service::Service;

use crate::resolver::Resolver;
use crate::spdy::dial::PortForwardDialer;

const PIPE_BUFFER: usize = 64 * 1024;

#[derive(Clone)]
pub struct PortForwardConnector {
    resolver: Arc<Resolver>,
    dialer: Arc<dyn PortForwardDialer>,
    namespace: String,
}

impl PortForwardConnector {
    pub fn new(
        resolver: Arc<Resolver>,
        dialer: Arc<dyn PortForwardDialer>,
        namespace: impl Into<String>,
    ) -> Self {
        Self { resolver, dialer, namespace: namespace.into() }
    }
}

impl Service<http::Uri> for PortForwardConnector {
    type Response = TokioIo<tokio::io::DuplexStream>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: http::Uri) -> Self::Future {
        let resolver = self.resolver.clone();
        let dialer = self.dialer.clone();
        let namespace = self.namespace.clone();

        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request uri has no host"))?;
            let addr = match uri.port_u16() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };

            let backend = resolver
                .resolve_backend(&addr)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{addr} svc not found")))?;

            let connection = match backend.dial_port_forward_once(dialer.as_ref(), &namespace).await {
                Ok(connection) => connection,
                Err(err) => {
                    resolver.delete_by_name(backend.name());
                    return Err(io::Error::other(err.to_string()));
                }
            };

            let (local, remote) = duplex(PIPE_BUFFER);
            let port = backend.matched_pod().target_port();
            let resolver_for_forward = resolver;
            let backend_name = backend.name().to_string();
            tokio::spawn(async move {
                if let Err(err) = connection.forward(remote, port, &[]).await {
                    tracing::warn!(%err, port, "http port-forward stream creation failed");
                    resolver_for_forward.delete_by_name(&backend_name);
                }
            });

            Ok(TokioIo::new(local))
        })
    }
}
