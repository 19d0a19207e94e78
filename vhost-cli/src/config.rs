use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Fronts Kubernetes services under a developer-friendly virtual
/// hostname, dialing a matching pod's port-forward connection on demand.
#[derive(Debug, Parser)]
#[command(name = "kube-vhost", version, about)]
pub struct Config {
    /// The IP address to serve on.
    #[arg(long, default_value = "127.0.0.1")]
    pub address: IpAddr,

    /// The port on which to run the proxy. 0 picks a random port.
    #[arg(short, long, default_value_t = 8010)]
    pub port: u16,

    /// Selector (label query) to filter services and pods on, e.g.
    /// `key1=value1,key2=value2`.
    #[arg(short = 'l', long)]
    pub selector: Option<String>,

    /// Namespace to watch. Defaults to the current context's namespace.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Path to a kubeconfig file. Defaults to the usual kubeconfig
    /// discovery (`$KUBECONFIG`, then `~/.kube/config`).
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Set verbose mode.
    #[arg(short, long)]
    pub verbose: bool,
}
