//! The HTTP server in front of the virtual API server.
use std::{net::SocketAddr, sync::Arc};

use axum::{Router, middleware, routing::get};
use snafu::{ResultExt as _, Snafu};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
};
use tower_http::trace::TraceLayer;
use vcluster_filters::{
    ServiceRedirect, ServiceRedirectLayer,
    request::{FrontProxyHeaders, attach_request_context},
};

use crate::proxy::{self, Upstream};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to bind TCP listener to {bind_address}"))]
    BindTcpListener {
        source: std::io::Error,
        bind_address: SocketAddr,
    },

    #[snafu(display("failed to create {signal} listener"))]
    CreateSignalListener {
        source: std::io::Error,
        signal: &'static str,
    },

    #[snafu(display("failed to run server"))]
    RunServer { source: std::io::Error },
}

/// Serves the virtual API surface.
///
/// `create` and `update` requests of Services are handled by the
/// [`ServiceRedirectLayer`], every other request is forwarded to the
/// [`Upstream`].
pub struct ProxyServer {
    router: Router,
    bind_address: SocketAddr,
}

impl ProxyServer {
    pub fn new(
        redirect: Arc<ServiceRedirect>,
        upstream: Upstream,
        front_proxy: FrontProxyHeaders,
        bind_address: SocketAddr,
    ) -> Self {
        Self {
            router: router(redirect, upstream, front_proxy),
            bind_address,
        }
    }

    /// Runs the server until a `SIGINT` or `SIGTERM` is received. In-flight
    /// requests are completed before returning.
    pub async fn run(self) -> Result<()> {
        let shutdown = shutdown_signal()?;

        let listener = TcpListener::bind(self.bind_address)
            .await
            .context(BindTcpListenerSnafu {
                bind_address: self.bind_address,
            })?;

        tracing::info!(bind_address = %self.bind_address, "listening for requests");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .context(RunServerSnafu)
    }
}

/// Builds the router. The health route sits outside of all layers, so it is
/// neither traced nor authenticated.
pub fn router(
    redirect: Arc<ServiceRedirect>,
    upstream: Upstream,
    front_proxy: FrontProxyHeaders,
) -> Router {
    Router::new()
        .fallback(proxy::forward)
        .with_state(upstream)
        .layer(ServiceRedirectLayer::new(redirect))
        .layer(middleware::from_fn_with_state(
            front_proxy,
            attach_request_context,
        ))
        .layer(TraceLayer::new_for_http())
        .route("/healthz", get(|| async { "ok" }))
}

/// Completes once `SIGINT` or `SIGTERM` is received.
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    let mut sigint = signal(SignalKind::interrupt())
        .context(CreateSignalListenerSnafu { signal: "SIGINT" })?;
    let mut sigterm = signal(SignalKind::terminate())
        .context(CreateSignalListenerSnafu { signal: "SIGTERM" })?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::debug!("received SIGINT"),
            _ = sigterm.recv() => tracing::debug!("received SIGTERM"),
        }
        tracing::info!("shutting down, waiting for in-flight requests");
    })
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use http::{Request, StatusCode};
    use kube::Config;
    use tower::ServiceExt as _;
    use vcluster_filters::{
        ServiceRedirectOptions,
        client::{Clients, KubeImpersonator},
    };

    use super::*;

    /// A router whose clusters are not reachable.
    fn unreachable_router() -> Router {
        let config = Config::new("http://127.0.0.1:1".parse().expect("valid URL"));
        let clients = Clients::from_configs(config.clone(), config.clone(), None)
            .expect("clients are created");
        let redirect = Arc::new(ServiceRedirect::new(
            clients,
            ServiceRedirectOptions::default(),
        ));
        let upstream = Upstream::new(
            KubeImpersonator::new(config, None),
            FrontProxyHeaders::default(),
        );

        router(redirect, upstream, FrontProxyHeaders::default())
    }

    #[tokio::test]
    async fn health_needs_no_user() {
        let response = unreachable_router()
            .oneshot(
                Request::get("/healthz")
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("infallible");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body is readable");
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn rejects_requests_without_user() {
        let response = unreachable_router()
            .oneshot(
                Request::get("/api/v1/namespaces/web/services")
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("infallible");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_unavailable() {
        let response = unreachable_router()
            .oneshot(
                Request::get("/api/v1/namespaces/web/configmaps")
                    .header("X-Remote-User", "jane")
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("infallible");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
