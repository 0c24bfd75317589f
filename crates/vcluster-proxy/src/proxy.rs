//! Forwards every request the filters pass on to the virtual API server.
//!
//! The request is sent with a [`kube::Client`] which impersonates the user
//! the front proxy authenticated. Credentials and identity headers of the
//! incoming request are never passed on.
use axum::{
    body::Body,
    extract::{Request, State},
    response::Response,
};
use http::{HeaderMap, StatusCode, Version, header};
use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};
use tracing::{Instrument as _, field::Empty};
use vcluster_filters::{
    client::{self, KubeImpersonator},
    codec::{ApiStatus, MAX_BODY_SIZE, Responder},
    request::{FrontProxyHeaders, UserInfo},
};

const IMPERSONATE_PREFIX: &str = "impersonate-";

/// Hop-by-hop headers, they only apply to a single connection.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("request has no user information attached"))]
    MissingUserInfo,

    #[snafu(display("request body exceeds {MAX_BODY_SIZE} bytes"))]
    BodyTooLarge,

    #[snafu(display("failed to read request body"))]
    ReadBody { source: axum::Error },

    #[snafu(display("failed to create client for the requesting user"))]
    Impersonate { source: client::Error },

    #[snafu(display("failed to send request to the virtual API server"))]
    SendRequest { source: kube::Error },
}

impl Error {
    fn status(&self) -> ApiStatus {
        match self {
            Self::MissingUserInfo | Self::Impersonate { .. } => ApiStatus::internal_error(self),
            Self::BodyTooLarge => ApiStatus::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "RequestEntityTooLarge",
                "the request body is too large",
            ),
            Self::ReadBody { .. } => ApiStatus::bad_request(self.to_string()),
            Self::SendRequest { source } => ApiStatus::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "ServiceUnavailable",
                format!("{self}: {source}"),
            ),
        }
    }
}

/// The virtual API server requests are forwarded to.
#[derive(Clone)]
pub struct Upstream {
    impersonator: KubeImpersonator,
    front_proxy: FrontProxyHeaders,
}

impl Upstream {
    pub fn new(impersonator: KubeImpersonator, front_proxy: FrontProxyHeaders) -> Self {
        Self {
            impersonator,
            front_proxy,
        }
    }

    /// Sends `request` to the virtual API server on behalf of the user
    /// attached to it and returns the unmodified response.
    pub async fn send(&self, request: Request) -> Result<Response, Error> {
        let (mut parts, body) = request.into_parts();
        let user = parts
            .extensions
            .remove::<UserInfo>()
            .context(MissingUserInfoSnafu)?;

        let content_length = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        ensure!(
            content_length.is_none_or(|length| length <= MAX_BODY_SIZE),
            BodyTooLargeSnafu
        );

        let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
            .await
            .context(ReadBodySnafu)?;

        let client = self
            .impersonator
            .kube_client_for(&user)
            .context(ImpersonateSnafu)?;

        strip_headers(&mut parts.headers, &self.front_proxy);
        parts.extensions = http::Extensions::new();
        parts.version = Version::default();

        let request = http::Request::from_parts(parts, kube::client::Body::from(body.to_vec()));
        let response = client.send(request).await.context(SendRequestSnafu)?;

        let mut response = response.map(Body::new);
        for name in HOP_BY_HOP {
            response.headers_mut().remove(*name);
        }

        Ok(response)
    }
}

/// Removes the headers which must not reach the virtual API server.
///
/// The client authenticates with its own credentials and sets the
/// impersonation headers itself, carrying over the uid and extra attributes
/// of the front proxy headers.
fn strip_headers(headers: &mut HeaderMap, front_proxy: &FrontProxyHeaders) {
    let extra_prefix = front_proxy.extra_prefix.to_lowercase();
    let stripped: Vec<_> = headers
        .keys()
        .filter(|name| {
            let name = name.as_str();
            name.starts_with(IMPERSONATE_PREFIX) || name.starts_with(&extra_prefix)
        })
        .cloned()
        .collect();

    for name in stripped {
        headers.remove(name);
    }

    headers.remove(header::AUTHORIZATION);
    headers.remove(header::HOST);
    headers.remove(front_proxy.username.as_str());
    headers.remove(front_proxy.uid.as_str());
    headers.remove(front_proxy.group.as_str());
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Fallback handler which forwards the request to the [`Upstream`].
pub async fn forward(State(upstream): State<Upstream>, request: Request) -> Response {
    let responder = Responder::from_headers(request.headers());
    let span = tracing::debug_span!(
        "forward",
        http.request.method = %request.method(),
        url.path = %request.uri().path(),
        http.response.status_code = Empty,
    );

    async move {
        match upstream.send(request).await {
            Ok(response) => {
                tracing::Span::current()
                    .record("http.response.status_code", response.status().as_u16());
                response
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to forward request"
                );
                responder.status(&error.status())
            }
        }
    }
    .instrument(span)
    .await
}
