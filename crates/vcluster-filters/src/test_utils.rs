//! In-memory API servers for tests.
//!
//! A [`FakeCluster`] stores Services in a map, allocates ClusterIPs starting
//! at `10.0.0.5`, records every call together with the acting user and can be
//! told to fail or hold individual operations.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use http::StatusCode;
use k8s_openapi::{
    api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, Service, ServicePort, ServiceSpec, ServiceStatus,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::ResourceExt as _;
use tokio::sync::Notify;

use crate::{
    ServiceRedirect, ServiceRedirectOptions,
    client::{Clients, Error, Impersonate, Result, ServiceClient, merge_patch_between},
    codec::{ApiStatus, MediaType},
    metadata::{MetadataTranslator as _, ObjectTranslator},
    request::UserInfo,
    service::{EXTERNAL_NAME, ServiceBody, service_type},
};

pub const TARGET_NAMESPACE: &str = "vcluster-ns";
pub const NAME_SUFFIX: &str = "vcluster";

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Get,
    Create,
    Update,
    Patch,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub actor: String,
    pub op: Op,
    pub namespace: String,
    pub name: String,
}

struct State {
    objects: BTreeMap<(String, String), Service>,
    calls: Vec<Call>,
    failures: BTreeMap<Op, ApiStatus>,
    next_ip: u8,
    resource_version: u64,
}

impl State {
    /// Applies what the API server does on every write.
    fn admit(&mut self, service: &mut Service) {
        self.resource_version += 1;
        service.metadata.resource_version = Some(self.resource_version.to_string());
        if service.metadata.uid.is_none() {
            service.metadata.uid = Some(format!("uid-{}", self.resource_version));
        }

        let type_ = service_type(service).to_owned();
        let spec = service.spec.get_or_insert_with(ServiceSpec::default);
        if type_ != EXTERNAL_NAME && spec.cluster_ip.as_deref().unwrap_or_default().is_empty() {
            let ip = format!("10.0.0.{}", self.next_ip);
            self.next_ip += 1;
            spec.cluster_ip = Some(ip.clone());
            spec.cluster_ips = Some(vec![ip]);
        }

        if type_ == "LoadBalancer" && service.status.is_none() {
            service.status = Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some("192.0.2.10".to_owned()),
                        ..LoadBalancerIngress::default()
                    }]),
                }),
                ..ServiceStatus::default()
            });
        }
    }
}

pub struct FakeCluster {
    state: Mutex<State>,
    holds: Mutex<BTreeMap<Op, Arc<Notify>>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                calls: Vec::new(),
                failures: BTreeMap::new(),
                next_ip: 5,
                resource_version: 100,
            }),
            holds: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn client(self: &Arc<Self>, actor: &str) -> Arc<dyn ServiceClient> {
        Arc::new(FakeClient {
            cluster: self.clone(),
            actor: actor.to_owned(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("lock is not poisoned")
    }

    /// Stores `service` without recording a call.
    pub fn insert(&self, mut service: Service) -> Service {
        let mut state = self.state();
        state.admit(&mut service);
        state.objects.insert(key(&service), service.clone());
        service
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.state()
            .objects
            .remove(&(namespace.to_owned(), name.to_owned()));
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state()
            .objects
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Makes every following call of `op` fail with `status`.
    pub fn fail(&self, op: Op, status: ApiStatus) {
        self.state().failures.insert(op, status);
    }

    /// Makes every following call of `op` wait for a notification of the
    /// returned [`Notify`] after it was recorded.
    pub fn hold(&self, op: Op) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.holds
            .lock()
            .expect("lock is not poisoned")
            .insert(op, notify.clone());
        notify
    }

    /// Sets the last octet of the next allocated ClusterIP.
    pub fn set_next_ip(&self, last_octet: u8) {
        self.state().next_ip = last_octet;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// The actors of all recorded calls of `op`, in call order.
    pub fn actors(&self, op: Op) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.op == op)
            .map(|call| call.actor.clone())
            .collect()
    }

    pub async fn wait_for_call(&self, op: Op) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            while self.actors(op).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("call was made in time");
    }

    pub async fn wait_for_object(
        &self,
        namespace: &str,
        name: &str,
        predicate: impl Fn(&Service) -> bool,
    ) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            while !self.object(namespace, name).is_some_and(|service| predicate(&service)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("object reached the expected state in time");
    }

    async fn begin(&self, actor: &str, op: Op, namespace: &str, name: &str) -> Result<()> {
        self.state().calls.push(Call {
            actor: actor.to_owned(),
            op,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        });

        let hold = self
            .holds
            .lock()
            .expect("lock is not poisoned")
            .get(&op)
            .cloned();
        if let Some(hold) = hold {
            hold.notified().await;
        }

        match self.state().failures.get(&op) {
            Some(status) => Err(Error::Api {
                status: status.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn key(service: &Service) -> (String, String) {
    (service.namespace().unwrap_or_default(), service.name_any())
}

fn not_found(name: &str) -> Error {
    Error::Api {
        status: ApiStatus::not_found("services", name),
    }
}

struct FakeClient {
    cluster: Arc<FakeCluster>,
    actor: String,
}

#[async_trait]
impl ServiceClient for FakeClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Service> {
        self.cluster
            .begin(&self.actor, Op::Get, namespace, name)
            .await?;
        self.cluster
            .object(namespace, name)
            .ok_or_else(|| not_found(name))
    }

    async fn create(&self, service: &Service) -> Result<Service> {
        let (namespace, name) = key(service);
        self.cluster
            .begin(&self.actor, Op::Create, &namespace, &name)
            .await?;

        let mut state = self.cluster.state();
        if state.objects.contains_key(&(namespace, name.clone())) {
            return Err(Error::Api {
                status: ApiStatus::new(
                    StatusCode::CONFLICT,
                    "AlreadyExists",
                    format!("services \"{name}\" already exists"),
                )
                .with_details("services", &name),
            });
        }

        let mut created = service.clone();
        state.admit(&mut created);
        state.objects.insert(key(&created), created.clone());
        Ok(created)
    }

    async fn update(&self, service: &Service) -> Result<Service> {
        let (namespace, name) = key(service);
        self.cluster
            .begin(&self.actor, Op::Update, &namespace, &name)
            .await?;

        let mut state = self.cluster.state();
        let stored = state
            .objects
            .get(&(namespace, name.clone()))
            .cloned()
            .ok_or_else(|| not_found(&name))?;

        if service
            .metadata
            .resource_version
            .as_ref()
            .is_some_and(|version| Some(version) != stored.metadata.resource_version.as_ref())
        {
            return Err(Error::Api {
                status: ApiStatus::new(
                    StatusCode::CONFLICT,
                    "Conflict",
                    format!(
                        "Operation cannot be fulfilled on services \"{name}\": the object has been modified; please apply your changes to the latest version and try again"
                    ),
                ),
            });
        }

        let mut updated = service.clone();
        updated.metadata.uid = stored.metadata.uid;
        state.admit(&mut updated);
        state.objects.insert(key(&updated), updated.clone());
        Ok(updated)
    }

    async fn merge_patch(&self, original: &Service, modified: &Service) -> Result<Service> {
        let (namespace, name) = key(original);
        self.cluster
            .begin(&self.actor, Op::Patch, &namespace, &name)
            .await?;

        let patch = merge_patch_between(original, modified)?;
        let mut state = self.cluster.state();
        let stored = state
            .objects
            .get(&(namespace, name.clone()))
            .cloned()
            .ok_or_else(|| not_found(&name))?;

        let mut value = serde_json::to_value(stored).expect("stored service serializes");
        json_patch::merge(&mut value, &patch);
        let mut patched: Service =
            serde_json::from_value(value).expect("patched service deserializes");
        state.admit(&mut patched);
        state.objects.insert(key(&patched), patched.clone());
        Ok(patched)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.cluster
            .begin(&self.actor, Op::Delete, namespace, name)
            .await?;
        self.cluster
            .state()
            .objects
            .remove(&(namespace.to_owned(), name.to_owned()))
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }
}

/// Hands out clients of the virtual [`FakeCluster`] acting as the user.
struct FakeImpersonator {
    cluster: Arc<FakeCluster>,
}

impl Impersonate for FakeImpersonator {
    fn impersonate(&self, user: &UserInfo) -> Result<Arc<dyn ServiceClient>> {
        Ok(self.cluster.client(&user.username))
    }
}

/// A [`ServiceRedirect`] wired to a physical and a virtual [`FakeCluster`].
pub struct Harness {
    pub physical: Arc<FakeCluster>,
    pub virtual_cluster: Arc<FakeCluster>,
    pub redirect: Arc<ServiceRedirect>,
}

impl Harness {
    pub const ADMIN: &'static str = "system:admin";
    pub const USERNAME: &'static str = "jane";

    pub fn new() -> Self {
        let physical = FakeCluster::new();
        let virtual_cluster = FakeCluster::new();

        let clients = Clients::new(
            physical.client(Self::ADMIN),
            virtual_cluster.client(Self::ADMIN),
            Arc::new(FakeImpersonator {
                cluster: virtual_cluster.clone(),
            }),
        );
        let options = ServiceRedirectOptions::builder()
            .target_namespace(TARGET_NAMESPACE)
            .name_suffix(NAME_SUFFIX)
            .build();

        Self {
            physical,
            virtual_cluster,
            redirect: Arc::new(ServiceRedirect::new(clients, options)),
        }
    }

    pub fn user() -> UserInfo {
        UserInfo {
            username: Self::USERNAME.to_owned(),
            groups: vec!["system:authenticated".to_owned()],
            ..UserInfo::default()
        }
    }

    pub fn user_client(&self) -> Arc<dyn ServiceClient> {
        self.virtual_cluster.client(Self::USERNAME)
    }

    pub fn body(service: &Service) -> ServiceBody {
        ServiceBody::new(
            MediaType::Json,
            serde_json::to_vec(service).expect("service serializes"),
        )
    }
}

/// A Service as a user would send it.
pub fn service(namespace: &str, name: &str, type_: &str) -> Service {
    let is_external_name = type_ == EXTERNAL_NAME;

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(type_.to_owned()),
            external_name: is_external_name.then(|| "example.com".to_owned()),
            selector: Some(BTreeMap::from([("app".to_owned(), name.to_owned())])),
            ports: (!is_external_name).then(|| {
                vec![ServicePort {
                    name: Some("http".to_owned()),
                    port: 80,
                    ..ServicePort::default()
                }]
            }),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}

/// Stores an `ExternalName` Service in the virtual cluster and its physical
/// counterpart. Returns the stored virtual Service.
pub fn external_name_pair(harness: &Harness, namespace: &str, name: &str) -> Service {
    let stored = harness
        .virtual_cluster
        .insert(service(namespace, name, EXTERNAL_NAME));

    let mut physical = ObjectTranslator::new(NAME_SUFFIX)
        .translate(TARGET_NAMESPACE, &stored)
        .expect("translation succeeds");
    if let Some(spec) = &mut physical.spec {
        spec.selector = None;
    }
    harness.physical.insert(physical);

    stored
}
