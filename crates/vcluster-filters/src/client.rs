//! Clients used to read and write Services in the physical and the virtual
//! cluster.
//!
//! The filters only ever talk to the API servers through the [`ServiceClient`]
//! trait. [`KubeServiceClient`] implements it on top of a [`kube::Client`].
//! [`Clients`] bundles the long-lived handles with the correct privileges:
//!
//! - the physical administrative client, used for all physical reads and
//!   writes (no user is ever impersonated in the physical cluster),
//! - the virtual administrative client,
//! - a factory for virtual clients impersonating the requesting user.
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderName, HeaderValue};
use k8s_openapi::api::core::v1::Service;
use kube::{
    Api, Client as KubeClient, Config, ResourceExt as _,
    api::{DeleteParams, Patch, PatchParams, PostParams},
};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::instrument;

use crate::{codec::ApiStatus, request::UserInfo};

const IMPERSONATE_UID: &str = "impersonate-uid";
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    /// The API server answered with a `Status` describing the failure.
    #[snafu(display("API request failed with {}: {}", status.reason, status.message))]
    Api { status: ApiStatus },

    #[snafu(display("failed to send API request"))]
    Request { source: kube::Error },

    #[snafu(display("object {name:?} has no name or namespace"))]
    MissingIdentity { name: String },

    #[snafu(display("failed to serialize object for merge patch"))]
    SerializePatch { source: serde_json::Error },

    #[snafu(display("failed to build impersonation headers for {username:?}"))]
    ImpersonationHeader {
        source: http::Error,
        username: String,
    },

    #[snafu(display("failed to create client impersonating {username:?}"))]
    Impersonate {
        source: kube::Error,
        username: String,
    },
}

impl Error {
    /// Returns the API status if the API server rejected the request.
    pub fn api_status(&self) -> Option<&ApiStatus> {
        match self {
            Self::Api { status } => Some(status),
            _ => None,
        }
    }

    /// Returns the HTTP code of the API status, if any.
    pub fn code(&self) -> Option<u16> {
        self.api_status().map(|status| status.code)
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    pub fn is_already_exists(&self) -> bool {
        self.api_status().is_some_and(|status| {
            status.code == 409 && (status.reason == "AlreadyExists" || status.reason.is_empty())
        })
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => {
                let code = http::StatusCode::from_u16(response.code)
                    .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
                Self::Api {
                    status: ApiStatus::new(code, response.reason.clone(), response.message.clone()),
                }
            }
            source => Self::Request { source },
        }
    }
}

/// Reads and writes Services of a single cluster.
///
/// All calls are single round-trips to the API server. Implementations must be
/// safe to share between concurrently handled requests.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Service>;

    async fn create(&self, service: &Service) -> Result<Service>;

    /// Replaces the Service. The `resourceVersion` of the passed object is
    /// used for optimistic concurrency control.
    async fn update(&self, service: &Service) -> Result<Service>;

    /// Sends a JSON merge patch which turns `original` into `modified`.
    async fn merge_patch(&self, original: &Service, modified: &Service) -> Result<Service>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Creates clients which act on behalf of a given user.
pub trait Impersonate: Send + Sync {
    fn impersonate(&self, user: &UserInfo) -> Result<Arc<dyn ServiceClient>>;
}

/// A [`ServiceClient`] backed by a [`kube::Client`].
#[derive(Clone)]
pub struct KubeServiceClient {
    client: KubeClient,
    post_params: PostParams,
    merge_patch_params: PatchParams,
    delete_params: DeleteParams,
}

impl KubeServiceClient {
    pub fn new(client: KubeClient, field_manager: Option<String>) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager: field_manager.clone(),
                ..PostParams::default()
            },
            merge_patch_params: PatchParams {
                field_manager,
                ..PatchParams::default()
            },
            delete_params: DeleteParams::default(),
        }
    }

    fn api(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Returns the namespace and name of `service`.
fn identity(service: &Service) -> Result<(String, String)> {
    let name = service.name_any();
    let namespace = service
        .namespace()
        .filter(|_| !name.is_empty())
        .context(MissingIdentitySnafu { name: name.clone() })?;

    Ok((namespace, name))
}

#[async_trait]
impl ServiceClient for KubeServiceClient {
    #[instrument(skip(self))]
    async fn get(&self, namespace: &str, name: &str) -> Result<Service> {
        Ok(self.api(namespace).get(name).await?)
    }

    #[instrument(skip_all, fields(k8s.service.name = service.name_any()))]
    async fn create(&self, service: &Service) -> Result<Service> {
        let namespace = service.namespace().context(MissingIdentitySnafu {
            name: service.name_any(),
        })?;

        Ok(self
            .api(&namespace)
            .create(&self.post_params, service)
            .await?)
    }

    #[instrument(skip_all, fields(k8s.service.name = service.name_any()))]
    async fn update(&self, service: &Service) -> Result<Service> {
        let (namespace, name) = identity(service)?;

        Ok(self
            .api(&namespace)
            .replace(&name, &self.post_params, service)
            .await?)
    }

    #[instrument(skip_all, fields(k8s.service.name = original.name_any()))]
    async fn merge_patch(&self, original: &Service, modified: &Service) -> Result<Service> {
        let (namespace, name) = identity(original)?;
        let patch = merge_patch_between(original, modified)?;

        Ok(self
            .api(&namespace)
            .patch(&name, &self.merge_patch_params, &Patch::Merge(&patch))
            .await?)
    }

    #[instrument(skip(self))]
    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.api(namespace)
            .delete(name, &self.delete_params)
            .await?;

        Ok(())
    }
}

/// Computes the JSON merge patch (RFC 7386) which turns `original` into
/// `modified`.
pub fn merge_patch_between(original: &Service, modified: &Service) -> Result<serde_json::Value> {
    let original = serde_json::to_value(original).context(SerializePatchSnafu)?;
    let modified = serde_json::to_value(modified).context(SerializePatchSnafu)?;

    Ok(create_merge_patch(&original, &modified))
}

/// Creates a JSON merge patch. Removed keys are set to `null`, arrays are
/// replaced as a whole.
pub fn create_merge_patch(
    original: &serde_json::Value,
    modified: &serde_json::Value,
) -> serde_json::Value {
    use serde_json::{Map, Value};

    let (Value::Object(original), Value::Object(modified)) = (original, modified) else {
        return modified.clone();
    };

    let mut patch = Map::new();
    for (key, original_value) in original {
        match modified.get(key) {
            None => {
                patch.insert(key.clone(), Value::Null);
            }
            Some(modified_value) if modified_value != original_value => {
                patch.insert(
                    key.clone(),
                    create_merge_patch(original_value, modified_value),
                );
            }
            Some(_) => {}
        }
    }

    for (key, modified_value) in modified {
        if !original.contains_key(key) {
            patch.insert(key.clone(), modified_value.clone());
        }
    }

    Value::Object(patch)
}

/// Creates [`KubeServiceClient`]s which impersonate the requesting user.
///
/// Every call constructs a new [`kube::Client`] from the stored [`Config`]
/// which sends the full identity of the user: username, groups, uid and extra
/// attributes.
#[derive(Clone)]
pub struct KubeImpersonator {
    config: Config,
    field_manager: Option<String>,
}

impl KubeImpersonator {
    pub fn new(config: Config, field_manager: Option<String>) -> Self {
        Self {
            config,
            field_manager,
        }
    }

    /// Returns a [`kube::Client`] which acts as `user`.
    pub fn kube_client_for(&self, user: &UserInfo) -> Result<KubeClient> {
        let mut config = self.config.clone();
        config.auth_info.impersonate = Some(user.username.clone());
        config.auth_info.impersonate_groups =
            (!user.groups.is_empty()).then(|| user.groups.clone());
        let headers = impersonation_headers(user).context(ImpersonationHeaderSnafu {
            username: user.username.clone(),
        })?;
        config.headers.extend(headers);

        KubeClient::try_from(config).context(ImpersonateSnafu {
            username: user.username.clone(),
        })
    }
}

/// The impersonation headers [`Config::auth_info`] has no field for:
/// `Impersonate-Uid` and one `Impersonate-Extra-<key>` header per value of an
/// extra attribute. Keys are percent-encoded, header names allow only a
/// subset of the characters a key may contain.
fn impersonation_headers(
    user: &UserInfo,
) -> Result<Vec<(HeaderName, HeaderValue)>, http::Error> {
    let mut headers = Vec::new();
    if let Some(uid) = &user.uid {
        headers.push((
            HeaderName::from_static(IMPERSONATE_UID),
            HeaderValue::from_str(uid)?,
        ));
    }

    for (key, values) in &user.extra {
        let name = format!("{IMPERSONATE_EXTRA_PREFIX}{}", urlencoding::encode(key));
        let name = HeaderName::from_bytes(name.as_bytes())?;
        for value in values {
            headers.push((name.clone(), HeaderValue::from_str(value)?));
        }
    }

    Ok(headers)
}

impl Impersonate for KubeImpersonator {
    fn impersonate(&self, user: &UserInfo) -> Result<Arc<dyn ServiceClient>> {
        let client = self.kube_client_for(user)?;
        Ok(Arc::new(KubeServiceClient::new(
            client,
            self.field_manager.clone(),
        )))
    }
}

/// The process-wide client handles used by the filters.
///
/// Constructed once and shared between all requests. The handles carry no
/// per-request state.
#[derive(Clone)]
pub struct Clients {
    physical: Arc<dyn ServiceClient>,
    virtual_admin: Arc<dyn ServiceClient>,
    impersonator: Arc<dyn Impersonate>,
}

impl Clients {
    pub fn new(
        physical: Arc<dyn ServiceClient>,
        virtual_admin: Arc<dyn ServiceClient>,
        impersonator: Arc<dyn Impersonate>,
    ) -> Self {
        Self {
            physical,
            virtual_admin,
            impersonator,
        }
    }

    /// Builds all clients from the configurations of the physical and the
    /// virtual cluster.
    pub fn from_configs(
        physical: Config,
        virtual_cluster: Config,
        field_manager: Option<String>,
    ) -> Result<Self> {
        let physical_client = KubeClient::try_from(physical).context(RequestSnafu)?;
        let virtual_client =
            KubeClient::try_from(virtual_cluster.clone()).context(RequestSnafu)?;

        Ok(Self::new(
            Arc::new(KubeServiceClient::new(physical_client, field_manager.clone())),
            Arc::new(KubeServiceClient::new(virtual_client, field_manager.clone())),
            Arc::new(KubeImpersonator::new(virtual_cluster, field_manager)),
        ))
    }

    /// The administrative client of the physical cluster.
    pub fn physical(&self) -> Arc<dyn ServiceClient> {
        self.physical.clone()
    }

    /// The administrative client of the virtual cluster.
    pub fn virtual_admin(&self) -> Arc<dyn ServiceClient> {
        self.virtual_admin.clone()
    }

    /// A client of the virtual cluster which acts on behalf of `user`, so that
    /// admission and RBAC apply to the user like they would without the filter.
    pub fn virtual_as(&self, user: &UserInfo) -> Result<Arc<dyn ServiceClient>> {
        self.impersonator.impersonate(user)
    }
}
