use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use kube::ResourceExt as _;
use snafu::{ResultExt as _, ensure};
use tracing::{Span, instrument};

use super::{ServiceBody, ServiceRedirect, cluster_ip};
use crate::{
    client::ServiceClient,
    error::{
        AlreadyExistsSnafu, FilterError, MissingNameSnafu, Result, SetupMetadataSnafu,
        VirtualSnafu,
    },
    saga::Saga,
    translate,
};

impl ServiceRedirect {
    /// Creates the physical Service and then the virtual Service carrying the
    /// ClusterIP the physical cluster allocated.
    ///
    /// The virtual Service is created with `user_client`, which must act on
    /// behalf of the requesting user. If that fails, the physical Service is
    /// deleted again and the error of the virtual create is returned.
    #[instrument(
        name = "create_service",
        skip_all,
        fields(
            k8s.namespace.name = namespace,
            k8s.service.name = tracing::field::Empty,
            physical.service.name = tracing::field::Empty,
        )
    )]
    pub async fn create(
        &self,
        user_client: Arc<dyn ServiceClient>,
        namespace: &str,
        body: &ServiceBody,
    ) -> Result<Service> {
        let mut service = body.decode()?;
        service.metadata.namespace = Some(namespace.to_owned());

        if service.metadata.name.as_deref().unwrap_or_default().is_empty() {
            service.metadata.name = service
                .metadata
                .generate_name
                .as_deref()
                .filter(|prefix| !prefix.is_empty())
                .map(translate::generate_name);
        }

        let name = service.name_any();
        ensure!(!name.is_empty(), MissingNameSnafu);
        Span::current().record("k8s.service.name", name.as_str());

        let mut physical_service = self
            .translator
            .translate(&self.target_namespace, &service)
            .context(SetupMetadataSnafu)?;
        if let Some(spec) = &mut physical_service.spec {
            spec.selector = None;
        }

        let physical_name = physical_service.name_any();
        Span::current().record("physical.service.name", physical_name.as_str());

        let physical = self.clients.physical();
        let created = match physical.create(&physical_service).await {
            Ok(created) => created,
            Err(error) if error.is_already_exists() => {
                tracing::info!("physical service already exists");
                return AlreadyExistsSnafu { name, namespace }.fail();
            }
            Err(source) => {
                return Err(FilterError::Physical {
                    source,
                    operation: "create",
                    name,
                    physical_name,
                });
            }
        };

        let mut saga = Saga::new("create-service");
        saga.on_rollback("create-physical-service", {
            let namespace = self.target_namespace.clone();
            let physical_name = physical_name.clone();
            async move { physical.delete(&namespace, &physical_name).await }
        });

        let spec = service.spec.get_or_insert_with(ServiceSpec::default);
        spec.cluster_ip = cluster_ip(&created).map(str::to_owned);
        spec.cluster_ips = created.spec.as_ref().and_then(|spec| spec.cluster_ips.clone());
        service.status = created.status;

        match user_client.create(&service).await {
            Ok(created) => {
                saga.complete();
                tracing::info!(
                    cluster_ip = cluster_ip(&created).unwrap_or_default(),
                    "created service"
                );
                Ok(created)
            }
            Err(source) => {
                let report = saga.roll_back().await;
                tracing::warn!(
                    error = %source,
                    compensated = report.is_clean(),
                    "virtual create failed, removed physical service"
                );
                Err(source).context(VirtualSnafu {
                    operation: "create",
                    name,
                })
            }
        }
    }
}
