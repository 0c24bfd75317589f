use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use vcluster_filters::{
    options::{DEFAULT_NAME_SUFFIX, DEFAULT_TARGET_NAMESPACE},
    request::FrontProxyHeaders,
};
use vcluster_telemetry::TelemetryOptions;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8443";

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the proxy.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(long_about = "")]
pub struct RunArguments {
    /// The physical namespace all Services of the virtual cluster are
    /// synced to.
    #[arg(long, env, default_value = DEFAULT_TARGET_NAMESPACE)]
    pub target_namespace: String,

    /// Suffix of physical object names, usually the name of the virtual
    /// cluster.
    #[arg(long, env, default_value = DEFAULT_NAME_SUFFIX)]
    pub name_suffix: String,

    /// Kubeconfig of the physical cluster. Inferred from the environment if
    /// not set.
    #[arg(long, env, value_name = "FILE")]
    pub physical_kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the virtual API server. Inferred from the environment if
    /// not set.
    #[arg(long, env, value_name = "FILE")]
    pub virtual_kubeconfig: Option<PathBuf>,

    /// The address the proxy listens on.
    #[arg(long, env, default_value = DEFAULT_BIND_ADDRESS)]
    pub bind_address: SocketAddr,

    /// Field manager used for all writes.
    #[arg(long, env)]
    pub field_manager: Option<String>,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub front_proxy: FrontProxyOptions,

    #[command(flatten)]
    pub telemetry: TelemetryOptions,
}

/// Header names set by the authenticating front proxy.
#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Front Proxy Options")]
pub struct FrontProxyOptions {
    /// Header which carries the authenticated username.
    #[arg(long, env, default_value = "X-Remote-User")]
    pub requestheader_username_header: String,

    /// Header which carries the uid of the authenticated user.
    #[arg(long, env, default_value = "X-Remote-Uid")]
    pub requestheader_uid_header: String,

    /// Header which carries the groups of the authenticated user.
    #[arg(long, env, default_value = "X-Remote-Group")]
    pub requestheader_group_header: String,

    /// Prefix of headers which carry extra attributes of the user.
    #[arg(long, env, default_value = "X-Remote-Extra-")]
    pub requestheader_extra_headers_prefix: String,
}

impl From<FrontProxyOptions> for FrontProxyHeaders {
    fn from(options: FrontProxyOptions) -> Self {
        Self {
            username: options.requestheader_username_header,
            uid: options.requestheader_uid_header,
            group: options.requestheader_group_header,
            extra_prefix: options.requestheader_extra_headers_prefix,
        }
    }
}
