//! Ambient request context: which resource a request targets ([`RequestInfo`])
//! and on behalf of whom it is made ([`UserInfo`]).
//!
//! Both are attached to incoming requests as extensions by an upstream layer
//! (see [`attach_request_context`]) and are only ever read by the filters.
use std::collections::BTreeMap;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse as _, Response},
};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::codec::{ApiStatus, Responder};

/// Sub paths of a namespace which are subresources of the namespace itself
/// rather than namespaced resources.
const NAMESPACE_SUBRESOURCES: &[&str] = &["status", "finalize"];

/// Describes the Kubernetes API request a HTTP request represents.
///
/// This follows the request info resolution rules of the Kubernetes API
/// server, see [`RequestInfo::resolve`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// Whether the request targets an API resource or any other path.
    pub is_resource_request: bool,

    /// The full request path.
    pub path: String,

    /// The Kubernetes verb, like `create`, `update` or `list`.
    pub verb: String,

    /// Either `api` or `apis`.
    pub api_prefix: String,

    /// The API group, empty for the core group.
    pub api_group: String,

    pub api_version: String,
    pub namespace: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,

    /// The path segments starting at the resource.
    pub parts: Vec<String>,
}

impl RequestInfo {
    /// Resolves the [`RequestInfo`] from the request method and URI.
    ///
    /// Valid resource paths look like:
    ///
    /// - `/api/{version}/namespaces/{namespace}/{resource}/{name}/{subresource}`
    /// - `/apis/{group}/{version}/{resource}/{name}`
    ///
    /// Everything else is resolved as a non-resource request with the lower
    /// cased HTTP method as verb.
    pub fn resolve(method: &Method, uri: &Uri) -> Self {
        let path = uri.path();
        let non_resource = || Self {
            is_resource_request: false,
            path: path.to_owned(),
            verb: method.as_str().to_lowercase(),
            ..Self::default()
        };

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let (api_prefix, api_group, api_version, mut parts) = match segments.as_slice() {
            ["api", version, rest @ ..] => ("api", "", *version, rest),
            ["apis", group, version, rest @ ..] => ("apis", *group, *version, rest),
            _ => return non_resource(),
        };

        let mut verb = match *method {
            Method::POST => "create",
            Method::GET | Method::HEAD => "get",
            Method::PUT => "update",
            Method::PATCH => "patch",
            Method::DELETE => "delete",
            _ => "",
        };

        // Deprecated watch paths: /api/v1/watch/namespaces/default/pods
        if parts.first() == Some(&"watch") {
            verb = "watch";
            parts = &parts[1..];
        }

        let mut namespace = "";
        if parts.first() == Some(&"namespaces") && parts.len() > 1 {
            namespace = parts[1];
            if parts.len() > 2 && !NAMESPACE_SUBRESOURCES.contains(&parts[2]) {
                parts = &parts[2..];
            }
        }

        let resource = parts.first().copied().unwrap_or_default();
        let name = parts.get(1).copied().unwrap_or_default();
        let subresource = parts.get(2).copied().unwrap_or_default();

        if name.is_empty() && verb == "get" {
            verb = if is_watch_query(uri) { "watch" } else { "list" };
        }

        if name.is_empty() && verb == "delete" {
            verb = "deletecollection";
        }

        Self {
            is_resource_request: true,
            path: path.to_owned(),
            verb: verb.to_owned(),
            api_prefix: api_prefix.to_owned(),
            api_group: api_group.to_owned(),
            api_version: api_version.to_owned(),
            namespace: namespace.to_owned(),
            resource: resource.to_owned(),
            subresource: subresource.to_owned(),
            name: name.to_owned(),
            parts: parts.iter().map(|part| (*part).to_owned()).collect(),
        }
    }

    /// Returns `true` if the request targets the core `v1` `services` resource
    /// itself (not one of its subresources).
    pub fn is_core_service_request(&self) -> bool {
        self.is_resource_request
            && self.api_group.is_empty()
            && self.api_version == "v1"
            && self.resource == "services"
            && self.subresource.is_empty()
    }
}

fn is_watch_query(uri: &Uri) -> bool {
    let Some(query) = uri.query() else {
        return false;
    };

    url::form_urlencoded::parse(query.as_bytes())
        .any(|(key, value)| key == "watch" && (value == "true" || value == "1"))
}

/// The authenticated principal a request is made on behalf of.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    pub uid: Option<String>,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

/// The header names an authenticating front proxy uses to pass the user
/// identity on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrontProxyHeaders {
    pub username: String,
    pub uid: String,
    pub group: String,

    /// Prefix of the extra attribute headers. The rest of the header name is
    /// the percent-encoded attribute key.
    pub extra_prefix: String,
}

impl Default for FrontProxyHeaders {
    fn default() -> Self {
        Self {
            username: "X-Remote-User".to_owned(),
            uid: "X-Remote-Uid".to_owned(),
            group: "X-Remote-Group".to_owned(),
            extra_prefix: "X-Remote-Extra-".to_owned(),
        }
    }
}

impl UserInfo {
    /// Reads the user identity set by an authenticating front proxy.
    ///
    /// Returns [`None`] if the username header is missing or empty. These
    /// headers must only be trusted if the connection was authenticated as
    /// coming from the front proxy.
    pub fn from_headers(headers: &HeaderMap, names: &FrontProxyHeaders) -> Option<Self> {
        let username = headers
            .get(&names.username)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())?
            .to_owned();

        let uid = headers
            .get(&names.uid)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_owned);

        let groups = headers
            .get_all(&names.group)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_owned)
            .collect();

        let extra_prefix = names.extra_prefix.to_lowercase();
        let mut extra: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            let Some(key) = name.as_str().strip_prefix(&extra_prefix) else {
                continue;
            };

            // Keys which are not validly encoded are kept as they are.
            let key = urlencoding::decode(key)
                .map_or_else(|_| key.to_owned(), std::borrow::Cow::into_owned);
            if let Ok(value) = value.to_str() {
                extra
                    .entry(key)
                    .or_default()
                    .push(value.to_owned());
            }
        }

        Some(Self {
            username,
            uid,
            groups,
            extra,
        })
    }
}

/// Middleware which resolves the [`RequestInfo`] and [`UserInfo`] of every
/// request and attaches them as request extensions.
///
/// Requests without a user identity are rejected with `401 Unauthorized`.
///
/// ```
/// use axum::{Router, middleware};
/// use vcluster_filters::request::{FrontProxyHeaders, attach_request_context};
///
/// let router: Router = Router::new().layer(middleware::from_fn_with_state(
///     FrontProxyHeaders::default(),
///     attach_request_context,
/// ));
/// ```
pub async fn attach_request_context(
    State(names): State<FrontProxyHeaders>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(user_info) = UserInfo::from_headers(request.headers(), &names) else {
        tracing::debug!("rejecting request without user identity");
        let status = ApiStatus::new(StatusCode::UNAUTHORIZED, "Unauthorized", "Unauthorized");
        return Responder::from_headers(request.headers())
            .status(&status)
            .into_response();
    };

    let request_info = RequestInfo::resolve(request.method(), request.uri());
    tracing::trace!(
        k8s.verb = %request_info.verb,
        k8s.resource = %request_info.resource,
        user = %user_info.username,
        "resolved request context"
    );

    let extensions = request.extensions_mut();
    extensions.insert(request_info);
    extensions.insert(user_info);

    next.run(request).await
}
