//! Serves the API of a virtual cluster and redirects Service mutations into
//! the physical cluster.
use std::{path::Path, sync::Arc};

use clap::Parser as _;
use kube::{
    Config,
    config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError},
};
use snafu::{ResultExt as _, Snafu};
use vcluster_filters::{
    ServiceRedirect, ServiceRedirectOptions,
    client::{self, Clients, KubeImpersonator},
    request::FrontProxyHeaders,
};
use vcluster_telemetry::Tracing;

use crate::{
    cli::{Cli, Command, RunArguments},
    proxy::Upstream,
    server::ProxyServer,
};

mod cli;
mod proxy;
mod server;

const APP_NAME: &str = "vcluster-proxy";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize tracing"))]
    InitTracing {
        source: vcluster_telemetry::tracing::Error,
    },

    #[snafu(display("failed to read kubeconfig {path:?}"))]
    ReadKubeconfig {
        source: KubeconfigError,
        path: std::path::PathBuf,
    },

    #[snafu(display("failed to infer cluster configuration"))]
    InferConfig { source: InferConfigError },

    #[snafu(display("failed to create cluster clients"))]
    CreateClients { source: client::Error },

    #[snafu(display("failed to run proxy server"))]
    RunServer { source: server::Error },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let Cli {
        command: Command::Run(arguments),
    } = Cli::parse();

    let RunArguments {
        target_namespace,
        name_suffix,
        physical_kubeconfig,
        virtual_kubeconfig,
        bind_address,
        field_manager,
        front_proxy,
        telemetry,
    } = arguments;

    let _tracing_guard = Tracing::pre_configured(APP_NAME, telemetry)
        .init()
        .context(InitTracingSnafu)?;

    tracing::info!(
        k8s.namespace.name = %target_namespace,
        vcluster.name_suffix = %name_suffix,
        "starting {APP_NAME}"
    );

    let physical = load_config(physical_kubeconfig.as_deref()).await?;
    let virtual_cluster = load_config(virtual_kubeconfig.as_deref()).await?;

    let clients = Clients::from_configs(physical, virtual_cluster.clone(), field_manager.clone())
        .context(CreateClientsSnafu)?;
    let options = ServiceRedirectOptions::builder()
        .target_namespace(target_namespace)
        .name_suffix(name_suffix)
        .build();
    let redirect = Arc::new(ServiceRedirect::new(clients, options));

    let front_proxy = FrontProxyHeaders::from(front_proxy);
    let upstream = Upstream::new(
        KubeImpersonator::new(virtual_cluster, field_manager),
        front_proxy.clone(),
    );

    ProxyServer::new(redirect, upstream, front_proxy, bind_address)
        .run()
        .await
        .context(RunServerSnafu)
}

/// Loads the kubeconfig at `path`, or infers the configuration from the
/// environment (`KUBECONFIG`, in-cluster service account) if no path is given.
async fn load_config(path: Option<&Path>) -> Result<Config, Error> {
    let Some(path) = path else {
        return Config::infer().await.context(InferConfigSnafu);
    };

    let kubeconfig = Kubeconfig::read_from(path).context(ReadKubeconfigSnafu { path })?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context(ReadKubeconfigSnafu { path })
}
