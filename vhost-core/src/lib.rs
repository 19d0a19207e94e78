//! Virtual-host routing and port-forward multiplexing for a developer
//! cluster proxy.
//!
//! Clients dial a service by its virtual hostname — `web:80` or
//! `web-80` — and are spliced through to a ready pod backing that
//! service over a multiplexed Kubernetes port-forward connection.
//! [`resolver::Resolver`] is the type that ties routing, pod tracking,
//! and live backends together; [`http`] and [`grpc`] adapt it to the
//! two transports this proxy fronts.

pub mod backend;
pub mod entry;
pub mod error;
pub mod grpc;
pub mod http;
pub mod http2frame;
pub mod k8s;
pub mod matched_pod;
pub mod resolver;
pub mod router;
pub mod spdy;

pub use entry::{ServicePortEntry, TargetPort};
pub use error::{DialError, ForwardError, GrpcPrefaceError, ResolverError, RouterError};
pub use matched_pod::MatchedPod;
pub use resolver::Resolver;
