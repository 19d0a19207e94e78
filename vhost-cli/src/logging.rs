use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. `verbose` lowers the
/// default level for this crate's own spans; `RUST_LOG` always wins
/// when set.
pub fn init(verbose: bool) {
    let default_directive = if verbose { "kube_vhost=debug,vhost_core=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
