//! The [`ServiceRedirectLayer`] intercepts Service `create` and `update`
//! requests and hands everything else to the wrapped service unchanged.
use std::{
    sync::Arc,
    task::{Context, Poll},
};

use axum::{extract::Request, response::Response};
use futures::future::BoxFuture;
use http::{StatusCode, Uri};
use snafu::{OptionExt as _, ResultExt as _, ensure};
use tower::{Layer, Service};
use tracing::{Instrument as _, field::Empty};

use crate::{
    codec::Responder,
    error::{
        FilterError, ImpersonateUserSnafu, InvalidOptionsSnafu, MissingRequestInfoSnafu,
        MissingUserInfoSnafu, NotAcceptableSnafu, Result, VirtualSnafu,
    },
    request::{RequestInfo, UserInfo},
    service::{EXTERNAL_NAME, ServiceBody, ServiceRedirect, service_type},
};

/// The only accepted value of the `dryRun` query parameter.
const DRY_RUN_ALL: &str = "All";

/// What to do with a request.
#[derive(Debug)]
pub enum Dispatch {
    /// The request was handled, send the response.
    Respond(Response),

    /// The request is not intercepted, pass it to the wrapped service.
    Forward(Request),
}

/// A [`Layer`] which wraps services with the [`ServiceRedirectService`].
///
/// The layer expects [`RequestInfo`] and [`UserInfo`] request extensions.
/// Requests without them are answered with an internal error.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use axum::Router;
/// use vcluster_filters::{ServiceRedirect, ServiceRedirectLayer};
///
/// # fn redirect() -> ServiceRedirect { unimplemented!() }
/// let router: Router = Router::new()
///     .fallback(|| async { "forwarded" })
///     .layer(ServiceRedirectLayer::new(Arc::new(redirect())));
/// ```
#[derive(Clone)]
pub struct ServiceRedirectLayer {
    redirect: Arc<ServiceRedirect>,
}

impl ServiceRedirectLayer {
    pub fn new(redirect: Arc<ServiceRedirect>) -> Self {
        Self { redirect }
    }
}

impl<S> Layer<S> for ServiceRedirectLayer {
    type Service = ServiceRedirectService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ServiceRedirectService {
            inner,
            redirect: self.redirect.clone(),
        }
    }
}

/// The [`Service`] created by the [`ServiceRedirectLayer`].
#[derive(Clone)]
pub struct ServiceRedirectService<S> {
    inner: S,
    redirect: Arc<ServiceRedirect>,
}

impl<S> Service<Request> for ServiceRedirectService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // The inner service was driven to readiness, a fresh clone is left
        // behind for the next call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let redirect = self.redirect.clone();

        Box::pin(async move {
            match redirect.dispatch(request).await {
                Dispatch::Respond(response) => Ok(response),
                Dispatch::Forward(request) => inner.call(request).await,
            }
        })
    }
}

impl ServiceRedirect {
    /// Handles Service `create` and `update` requests which are not dry runs.
    ///
    /// Updates are only intercepted if the existing Service is of type
    /// `ExternalName`. All other Services already have a physical counterpart
    /// with a ClusterIP, which normal updates never change.
    pub async fn dispatch(&self, request: Request) -> Dispatch {
        let responder = Responder::from_headers(request.headers());
        let span = tracing::info_span!(
            "service_redirect",
            k8s.verb = Empty,
            k8s.namespace.name = Empty,
            k8s.service.name = Empty,
        );

        match self.try_dispatch(request, responder).instrument(span.clone()).await {
            Ok(dispatch) => dispatch,
            Err(error) => {
                let status = error.status();
                span.in_scope(|| {
                    if status.code >= 500 {
                        tracing::error!(
                            error = &error as &dyn std::error::Error,
                            "failed to redirect service request"
                        );
                    } else {
                        tracing::debug!(
                            error = &error as &dyn std::error::Error,
                            code = status.code,
                            "rejected service request"
                        );
                    }
                });
                Dispatch::Respond(responder.status(&status))
            }
        }
    }

    async fn try_dispatch(&self, request: Request, responder: Responder) -> Result<Dispatch> {
        let info = request
            .extensions()
            .get::<RequestInfo>()
            .context(MissingRequestInfoSnafu)?
            .clone();
        let user = request
            .extensions()
            .get::<UserInfo>()
            .context(MissingUserInfoSnafu)?
            .clone();

        if !info.is_core_service_request() || !matches!(info.verb.as_str(), "create" | "update") {
            return Ok(Dispatch::Forward(request));
        }

        let span = tracing::Span::current();
        span.record("k8s.verb", info.verb.as_str());
        span.record("k8s.namespace.name", info.namespace.as_str());
        span.record("k8s.service.name", info.name.as_str());

        if is_dry_run(request.uri())? {
            tracing::debug!("forwarding dry run");
            return Ok(Dispatch::Forward(request));
        }

        // Nothing may be written if the result cannot be returned.
        if info.verb == "create" {
            ensure!(responder.is_acceptable(), NotAcceptableSnafu);
            let user_client = self.clients().virtual_as(&user).context(ImpersonateUserSnafu)?;
            let body = ServiceBody::read(request).await?;
            let created = self.create(user_client, &info.namespace, &body).await?;

            return Ok(Dispatch::Respond(
                responder.object(StatusCode::CREATED, &created),
            ));
        }

        if info.name.is_empty() {
            tracing::debug!("forwarding update without object name");
            return Ok(Dispatch::Forward(request));
        }

        let existing = self
            .clients()
            .virtual_admin()
            .get(&info.namespace, &info.name)
            .await
            .context(VirtualSnafu {
                operation: "get",
                name: info.name.as_str(),
            })?;
        if service_type(&existing) != EXTERNAL_NAME {
            tracing::trace!("forwarding update of service with cluster IP");
            return Ok(Dispatch::Forward(request));
        }

        ensure!(responder.is_acceptable(), NotAcceptableSnafu);
        let user_client = self.clients().virtual_as(&user).context(ImpersonateUserSnafu)?;
        let body = ServiceBody::read(request).await?;
        let updated = self.update(user_client, &existing, &body).await?;

        Ok(Dispatch::Respond(responder.object(StatusCode::OK, &updated)))
    }
}

/// Returns whether the request asks for a dry run. Like the API server, only
/// `All` is accepted as value.
fn is_dry_run(uri: &Uri) -> Result<bool, FilterError> {
    let Some(query) = uri.query() else {
        return Ok(false);
    };

    let mut dry_run = false;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key != "dryRun" {
            continue;
        }

        if value != DRY_RUN_ALL {
            return InvalidOptionsSnafu {
                message: format!(
                    "dryRun: Unsupported value: \"{value}\": supported values: \"{DRY_RUN_ALL}\""
                ),
            }
            .fail();
        }
        dry_run = true;
    }

    Ok(dry_run)
}
