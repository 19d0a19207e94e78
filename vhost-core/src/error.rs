use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced while establishing a port-forward connection to a pod.
#[derive(Debug, Error, Clone)]
pub enum DialError {
    #[error("upgrade to port-forward subprotocol failed: {0}")]
    Upgrade(String),

    #[error("io error dialing port-forward: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for DialError {
    fn from(err: std::io::Error) -> Self {
        DialError::Io(Arc::new(err))
    }
}

/// Errors surfaced by a single `forward` call. Only stream *creation*
/// failures reach a caller; everything past that point is logged per the
/// crash-nothing policy.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("creating {kind} stream for port {port}: {source}")]
    StreamCreation {
        kind: &'static str,
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced while resolving a virtual hostname to a live backend.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("{0} svc not found")]
    LookupMiss(String),

    #[error("no live backend for {0}")]
    NoLiveBackend(String),

    #[error("dial failed: {0}")]
    Dial(#[from] DialError),
}

/// Errors from [`crate::router::ServicePortRouter`]. Lookups and inserts
/// can't currently fail — the table is append-only and keyed by strings
/// derived from data already on hand — so this has no variants yet. Kept
/// so callers can match on a stable error type if routing ever grows a
/// fallible path (e.g. rejecting a malformed hostname alias).
#[derive(Debug, Error)]
pub enum RouterError {}

/// Errors surfaced while sniffing a gRPC (HTTP/2 cleartext) client preface.
#[derive(Debug, Error)]
pub enum GrpcPrefaceError {
    #[error("invalid grpc preface data")]
    InvalidPreface,

    #[error("expected {expected} frame, got something else")]
    UnexpectedFrame { expected: &'static str },

    #[error(":authority pseudo-header missing from preface headers")]
    MissingAuthority,

    #[error("io error reading preface: {0}")]
    Io(#[from] std::io::Error),
}
