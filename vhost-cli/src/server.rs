//! The proxy's listener: one socket, dispatched per connection to
//! either the gRPC (HTTP/2 cleartext) preface sniffer or an HTTP/1.1
//! reverse proxy that routes by path prefix — `/<vhost>/...` — the way
//! a developer's browser or `curl` addresses it.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use vhost_core::grpc;
use vhost_core::http::PortForwardConnector;
use vhost_core::resolver::Resolver;
use vhost_core::spdy::dial::PortForwardDialer;

type ProxyBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;
type ProxyClient = LegacyClient<PortForwardConnector, Incoming>;

const HTTP2_PREFIX: &[u8; 18] = b"PRI * HTTP/2.0\r\n\r\n";

pub struct Server {
    resolver: Arc<Resolver>,
    dialer: Arc<dyn PortForwardDialer>,
    namespace: String,
}

impl Server {
    pub fn new(resolver: Arc<Resolver>, dialer: Arc<dyn PortForwardDialer>, namespace: String) -> Self {
        Self { resolver, dialer, namespace }
    }

    /// Accepts connections until `shutdown` resolves, then stops
    /// accepting and waits for every in-flight connection handler to
    /// finish before returning — so a `SIGINT`/`SIGTERM` drains cleanly
    /// instead of severing sessions mid-forward.
    pub async fn serve(&self, addr: SocketAddr, shutdown: impl std::future::Future<Output = ()>) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(address = %local_addr, "proxy listening");

        let connector = PortForwardConnector::new(
            self.resolver.clone(),
            self.dialer.clone(),
            self.namespace.clone(),
        );
        let client: ProxyClient = LegacyClient::builder(TokioExecutor::new()).build(connector);

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received, draining in-flight connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let resolver = self.resolver.clone();
                    let dialer = self.dialer.clone();
                    let namespace = self.namespace.clone();
                    let client = client.clone();

                    connections.spawn(async move {
                        if let Err(err) =
                            handle_connection(stream, resolver, dialer, namespace, client).await
                        {
                            tracing::warn!(%peer, %err, "connection ended with an error");
                        }
                    });
                }
            }
        }

        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    resolver: Arc<Resolver>,
    dialer: Arc<dyn PortForwardDialer>,
    namespace: String,
    client: ProxyClient,
) -> io::Result<()> {
    if peek_http2_preface(&stream).await? {
        let mut prefix = [0u8; HTTP2_PREFIX.len()];
        stream.read_exact(&mut prefix).await?;
        return handle_grpc_connection(stream, resolver, dialer, namespace).await;
    }

    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let resolver = resolver.clone();
        let client = client.clone();
        async move { Ok::<_, Infallible>(proxy_http_request(req, resolver, client).await) }
    });

    http1::Builder::new()
        .serve_connection(io, service)
        .await
        .map_err(|err| io::Error::other(err.to_string()))
}

/// Peeks without consuming: waits until at least `HTTP2_PREFIX.len()`
/// bytes have arrived (or the peer closes early) and reports whether
/// they match the HTTP/2 cleartext connection preface.
async fn peek_http2_preface(stream: &TcpStream) -> io::Result<bool> {
    let mut buf = [0u8; HTTP2_PREFIX.len()];
    loop {
        stream.readable().await?;
        match stream.peek(&mut buf) {
            Ok(n) if n == buf.len() => return Ok(&buf == HTTP2_PREFIX),
            Ok(0) => return Ok(false),
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
}

async fn handle_grpc_connection(
    mut stream: TcpStream,
    resolver: Arc<Resolver>,
    dialer: Arc<dyn PortForwardDialer>,
    namespace: String,
) -> io::Result<()> {
    let preface = match grpc::sniff_preface(&mut stream).await {
        Ok(preface) => preface,
        Err(err) => {
            tracing::warn!(%err, "invalid grpc preface");
            return Ok(());
        }
    };

    let host = preface
        .authority
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(&preface.authority);

    let backend = resolver
        .resolve_backend(&preface.authority)
        .or_else(|| resolver.resolve_backend(host));
    let Some(backend) = backend else {
        tracing::warn!(authority = %preface.authority, "svc not found");
        return Ok(());
    };

    let connection = match backend.dial_port_forward_once(dialer.as_ref(), &namespace).await {
        Ok(connection) => connection,
        Err(err) => {
            tracing::warn!(%err, "dialing port-forward for grpc connection");
            resolver.delete_by_name(backend.name());
            return Ok(());
        }
    };

    let port = backend.matched_pod().target_port();
    if let Err(err) = connection.forward(stream, port, &preface.client_preface).await {
        tracing::warn!(%err, "grpc stream creation failed");
        resolver.delete_by_name(backend.name());
    }
    Ok(())
}

/// Matches `/<vhost>/rest...` against every known service's hostname
/// alias and, on a match, reverse-proxies the remainder to it.
async fn proxy_http_request(
    req: Request<Incoming>,
    resolver: Arc<Resolver>,
    client: ProxyClient,
) -> Response<ProxyBody> {
    let path = req.uri().path().to_string();
    let Some((vhost, rest)) = match_vhost(&resolver, &path) else {
        return not_found();
    };

    let uri = match format!("http://{vhost}{rest}").parse() {
        Ok(uri) => uri,
        Err(_) => return bad_gateway(),
    };

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;

    let forwarded = Request::from_parts(parts, body);
    match client.request(forwarded).await {
        Ok(resp) => resp.map(|b| b.map_err(hyper::Error::from).boxed()),
        Err(err) => {
            tracing::warn!(%err, vhost, "proxying http request");
            bad_gateway()
        }
    }
}

fn match_vhost<'a>(resolver: &Resolver, path: &'a str) -> Option<(String, &'a str)> {
    let path = path.strip_prefix('/')?;
    for entry in resolver.list_services() {
        let name = entry.source_host_name();
        if let Some(rest) = path.strip_prefix(&name) {
            if rest.is_empty() || rest.starts_with('/') {
                return Some((name, rest));
            }
        }
    }
    None
}

fn not_found() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from_static(b"svc not found")).map_err(|e: std::convert::Infallible| match e {}).boxed())
        .expect("static response is valid")
}

fn bad_gateway() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Full::new(Bytes::from_static(b"port-forward dial failed")).map_err(|e: std::convert::Infallible| match e {}).boxed())
        .expect("static response is valid")
}
