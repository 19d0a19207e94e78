//! Request-ID-multiplexed port-forward connection.
//!
//! A single upgraded port-forward session carries many logical
//! connections, one per local dial, each split into an error stream and
//! a data stream keyed by a shared decimal request id. This module owns
//! that multiplexing; it knows nothing about how the underlying session
//! was established — see [`dial`] for that boundary.

pub mod dial;

use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::Instrument;

use crate::error::ForwardError;

/// One substream of the upgraded session. Anything that reads and writes
/// bytes and can be driven from an async task qualifies.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub enum StreamType {
    Error,
    Data,
}

/// The headers a logical stream is opened with: the kind of stream, the
/// pod port it addresses, and the request id tying an error stream to
/// its sibling data stream.
pub struct StreamHeaders {
    pub stream_type: StreamType,
    pub port: u16,
    pub request_id: u32,
}

/// The raw multiplexing transport a [`Connection`] is built on. Whatever
/// performed the upgrade handshake (see [`dial::PortForwardDialer`])
/// implements this so `Connection` can open new logical streams on it.
#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync {
    async fn create_stream(&self, headers: StreamHeaders) -> io::Result<Box<dyn Stream>>;

    /// Resolves once the underlying session has ended, for any reason.
    async fn closed(&self);

    async fn close(&self) -> io::Result<()>;
}

type StreamCallback = Arc<dyn Fn(u32) + Send + Sync>;

struct RequestIdGenerator {
    next: AtomicU32,
}

impl RequestIdGenerator {
    fn new() -> Self {
        Self { next: AtomicU32::new(0) }
    }

    fn next_request_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// A single upgraded port-forward session, able to multiplex any number
/// of concurrent logical forwards over it.
pub struct Connection {
    inner: Arc<dyn StreamConnection>,
    request_ids: RequestIdGenerator,
    in_flight: AtomicUsize,
    idle: Notify,
    on_create_stream: Option<StreamCallback>,
    on_close_stream: Option<StreamCallback>,
}

impl Connection {
    pub fn new(inner: Arc<dyn StreamConnection>) -> Self {
        Self {
            inner,
            request_ids: RequestIdGenerator::new(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            on_create_stream: None,
            on_close_stream: None,
        }
    }

    pub fn with_stream_callbacks(
        mut self,
        on_create_stream: Option<StreamCallback>,
        on_close_stream: Option<StreamCallback>,
    ) -> Self {
        self.on_create_stream = on_create_stream;
        self.on_close_stream = on_close_stream;
        self
    }

    /// Opens a fresh request id's error/data stream pair, replays
    /// `client_preface` onto the data stream, then splices bytes between
    /// `conn` and the data stream until either side is done.
    ///
    /// Only stream *creation* failures are returned to the caller; once
    /// both streams exist, forwarding errors are logged and swallowed so
    /// one broken local connection never brings the proxy down.
    pub async fn forward<T>(
        &self,
        conn: T,
        port: u16,
        client_preface: &[u8],
    ) -> Result<(), ForwardError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard { connection: self };

        let request_id = self.request_ids.next_request_id();
        let span = tracing::debug_span!("port_forward", request_id, port);

        let mut error_stream = self
            .inner
            .create_stream(StreamHeaders {
                stream_type: StreamType::Error,
                port,
                request_id,
            })
            .await
            .map_err(|source| ForwardError::StreamCreation { kind: "error", port, source })?;
        let _ = error_stream.shutdown().await;
        tokio::spawn(drain_error_stream(error_stream, port).instrument(span.clone()));

        let mut data_stream = self
            .inner
            .create_stream(StreamHeaders {
                stream_type: StreamType::Data,
                port,
                request_id,
            })
            .await
            .map_err(|source| ForwardError::StreamCreation { kind: "data", port, source })?;

        if let Some(cb) = &self.on_create_stream {
            cb(request_id);
        }
        tracing::debug!(parent: &span, "stream pair created");

        if let Err(err) = data_stream.write_all(client_preface).await {
            tracing::warn!(parent: &span, %err, "writing client preface to data stream");
        }

        let (mut data_r, mut data_w) = split(data_stream);
        let (mut conn_r, mut conn_w) = split(conn);

        let remote_to_local = tokio::spawn(
            async move {
                let result = tokio::io::copy(&mut data_r, &mut conn_w).await;
                log_copy_result(result, "remote stream to local connection");
            }
            .instrument(span.clone()),
        );

        let local_to_remote = tokio::spawn(
            async move {
                let result = tokio::io::copy(&mut conn_r, &mut data_w).await;
                let _ = data_w.shutdown().await;
                log_copy_result(result, "local connection to remote stream");
            }
            .instrument(span.clone()),
        );

        tokio::select! {
            _ = remote_to_local => {}
            _ = local_to_remote => {}
        }

        if let Some(cb) = &self.on_close_stream {
            cb(request_id);
        }
        tracing::debug!(parent: &span, "stream pair closed");

        Ok(())
    }

    pub async fn closed(&self) {
        self.inner.closed().await
    }

    /// Waits for every in-flight `forward` call to finish, then tears
    /// down the underlying session.
    pub async fn close(&self) -> io::Result<()> {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            self.idle.notified().await;
        }
        self.inner.close().await
    }
}

struct InFlightGuard<'a> {
    connection: &'a Connection,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.connection.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.connection.idle.notify_waiters();
        }
    }
}

async fn drain_error_stream(mut stream: Box<dyn Stream>, port: u16) {
    let mut message = Vec::new();
    if let Err(err) = stream.read_to_end(&mut message).await {
        tracing::warn!(port, %err, "reading error stream");
        return;
    }
    if !message.is_empty() {
        tracing::warn!(
            port,
            message = %String::from_utf8_lossy(&message),
            "port-forward reported an error"
        );
    }
}

fn log_copy_result(result: io::Result<u64>, direction: &str) {
    match result {
        Ok(_) => {}
        Err(err) if is_benign_close(&err) => {}
        Err(err) => tracing::warn!(%err, direction, "error copying port-forward stream"),
    }
}

fn is_benign_close(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    match err.kind() {
        BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected | UnexpectedEof => true,
        _ => {
            let msg = err.to_string();
            msg.contains("closed network connection") || msg.contains("closed pipe")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    struct FakeStreamConnection {
        closed: Notify,
    }

    #[async_trait::async_trait]
    impl StreamConnection for FakeStreamConnection {
        async fn create_stream(&self, headers: StreamHeaders) -> io::Result<Box<dyn Stream>> {
            let (ours, theirs) = duplex(4096);
            if matches!(headers.stream_type, StreamType::Data) {
                tokio::spawn(async move {
                    let mut theirs = theirs;
                    let mut buf = [0u8; 4096];
                    loop {
                        match theirs.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if theirs.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
            Ok(Box::new(ours))
        }

        async fn closed(&self) {
            self.closed.notified().await;
        }

        async fn close(&self) -> io::Result<()> {
            self.closed.notify_waiters();
            Ok(())
        }
    }

    #[tokio::test]
    async fn forward_echoes_preface_and_client_bytes() {
        let connection = Connection::new(Arc::new(FakeStreamConnection { closed: Notify::new() }));
        let (local, mut remote) = duplex(4096);

        let forwarding = tokio::spawn(async move {
            connection.forward(local, 8080, b"PREFACE").await.unwrap();
        });

        let mut buf = [0u8; 7];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PREFACE");

        remote.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        remote.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(remote);
        forwarding.await.unwrap();
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_forwards() {
        let connection = Arc::new(Connection::new(Arc::new(FakeStreamConnection {
            closed: Notify::new(),
        })));
        let (local, remote) = duplex(4096);

        let forward_connection = connection.clone();
        let forwarding = tokio::spawn(async move {
            forward_connection.forward(local, 1, b"").await.unwrap();
        });

        drop(remote);
        forwarding.await.unwrap();
        connection.close().await.unwrap();
    }
}
