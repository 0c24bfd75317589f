use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use kube::ResourceExt as _;
use snafu::{ResultExt as _, ensure};
use tracing::instrument;

use super::{ServiceBody, ServiceRedirect, cluster_ip, service_type};
use crate::{
    client::ServiceClient,
    critical::critical_section,
    error::{
        CriticalSectionSnafu, FilterError, InvalidOptionsSnafu, NotFoundSnafu, PhysicalSnafu,
        Result, VirtualSnafu,
    },
    saga::Saga,
};

impl ServiceRedirect {
    /// Updates an `ExternalName` Service.
    ///
    /// Updates which keep the type, carry a ClusterIP or are based on an
    /// outdated `resourceVersion` are sent to the virtual cluster only, using
    /// `user_client`. A transition to a type with a ClusterIP first patches the
    /// physical Service so the physical cluster allocates an IP, then updates
    /// the virtual Service with it. The transition runs to completion even if
    /// the request is cancelled.
    #[instrument(
        name = "update_service",
        skip_all,
        fields(
            k8s.namespace.name = %existing.namespace().unwrap_or_default(),
            k8s.service.name = %existing.name_any(),
        )
    )]
    pub async fn update(
        &self,
        user_client: Arc<dyn ServiceClient>,
        existing: &Service,
        body: &ServiceBody,
    ) -> Result<Service> {
        let mut service = body.decode()?;
        let name = existing.name_any();
        let namespace = existing.namespace().unwrap_or_default();

        let object_name = service.metadata.name.clone().unwrap_or_default();
        ensure!(object_name == name, InvalidOptionsSnafu {
            message: format!(
                "the name of the object ({object_name}) does not match the name on the URL ({name})"
            ),
        });
        let object_namespace = service.metadata.namespace.as_deref().unwrap_or_default();
        ensure!(
            object_namespace.is_empty() || object_namespace == namespace,
            InvalidOptionsSnafu {
                message: "the namespace of the provided object does not match the namespace sent on the request",
            }
        );
        service.metadata.namespace = Some(namespace.clone());

        let is_stale = service.metadata.resource_version != existing.metadata.resource_version;
        if is_stale
            || service_type(&service) == service_type(existing)
            || cluster_ip(&service).is_some()
        {
            tracing::debug!(is_stale, "no type transition, updating virtual service only");
            return user_client
                .update(&service)
                .await
                .context(VirtualSnafu {
                    operation: "update",
                    name,
                });
        }

        tracing::info!(
            from = service_type(existing),
            to = service_type(&service),
            "transitioning service type"
        );

        let transition = TypeTransition {
            physical: self.clients.physical(),
            virtual_admin: self.clients.virtual_admin(),
            target_namespace: self.target_namespace.clone(),
            physical_name: self.translator.physical_name(&name, &namespace),
            name,
        };

        critical_section("service-type-transition", transition.run(service))
            .await
            .context(CriticalSectionSnafu)?
    }
}

/// Moves a Service from `ExternalName` to a type which has a ClusterIP.
struct TypeTransition {
    physical: Arc<dyn ServiceClient>,
    virtual_admin: Arc<dyn ServiceClient>,
    target_namespace: String,
    physical_name: String,
    name: String,
}

impl TypeTransition {
    async fn run(self, mut service: Service) -> Result<Service> {
        let original = match self
            .physical
            .get(&self.target_namespace, &self.physical_name)
            .await
        {
            Ok(original) => original,
            Err(error) if error.is_not_found() => {
                return NotFoundSnafu { name: self.name }.fail();
            }
            Err(source) => {
                return Err(FilterError::Physical {
                    source,
                    operation: "get",
                    name: self.name,
                    physical_name: self.physical_name,
                });
            }
        };

        let requested = service.spec.clone().unwrap_or_default();
        let mut modified = original.clone();
        let spec = modified.spec.get_or_insert_with(ServiceSpec::default);
        spec.ports = requested.ports;
        spec.type_ = requested.type_;
        spec.cluster_ip = None;
        spec.cluster_ips = None;

        let patched = self
            .physical
            .merge_patch(&original, &modified)
            .await
            .with_context(|_| PhysicalSnafu {
                operation: "patch",
                name: self.name.clone(),
                physical_name: self.physical_name.clone(),
            })?;

        // The physical Service was an ExternalName Service before and
        // nothing remains to restore it to, so it is removed.
        let mut saga = Saga::new("service-type-transition");
        saga.on_rollback("patch-physical-service", {
            let physical = self.physical.clone();
            let namespace = self.target_namespace.clone();
            let physical_name = self.physical_name.clone();
            async move { physical.delete(&namespace, &physical_name).await }
        });

        let spec = service.spec.get_or_insert_with(ServiceSpec::default);
        spec.cluster_ip = cluster_ip(&patched).map(str::to_owned);
        spec.cluster_ips = patched.spec.as_ref().and_then(|spec| spec.cluster_ips.clone());

        match self.virtual_admin.update(&service).await {
            Ok(updated) => {
                saga.complete();
                tracing::info!(
                    cluster_ip = cluster_ip(&updated).unwrap_or_default(),
                    "updated service"
                );
                Ok(updated)
            }
            Err(source) => {
                let report = saga.roll_back().await;
                tracing::error!(
                    error = %source,
                    compensated = report.is_clean(),
                    "virtual update failed after the physical service was patched, removed physical service"
                );
                Err(source).context(VirtualSnafu {
                    operation: "update",
                    name: self.name,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use k8s_openapi::api::core::v1::ServicePort;
    use rstest::rstest;

    use super::*;
    use crate::{
        codec::ApiStatus,
        service::EXTERNAL_NAME,
        test_utils::{Harness, Op, TARGET_NAMESPACE, external_name_pair, service},
    };

    #[tokio::test]
    async fn transitions_away_from_external_name() {
        let harness = Harness::new();
        let existing = external_name_pair(&harness, "web", "frontend");
        harness.physical.set_next_ip(9);

        let mut request = service("web", "frontend", "ClusterIP");
        request.metadata.resource_version = existing.metadata.resource_version.clone();
        request.spec.get_or_insert_default().ports = Some(vec![ServicePort {
            name: Some("https".to_owned()),
            port: 443,
            ..ServicePort::default()
        }]);

        let updated = harness
            .redirect
            .update(harness.user_client(), &existing, &Harness::body(&request))
            .await
            .expect("update succeeds");

        assert_eq!(service_type(&updated), "ClusterIP");
        assert_eq!(cluster_ip(&updated), Some("10.0.0.9"));

        let physical = harness
            .physical
            .object(TARGET_NAMESPACE, "frontend-x-web-x-vcluster")
            .expect("physical service exists");
        assert_eq!(service_type(&physical), "ClusterIP");
        assert_eq!(cluster_ip(&physical), Some("10.0.0.9"));
        assert_eq!(
            physical.spec.as_ref().and_then(|spec| spec.ports.clone()),
            request.spec.as_ref().and_then(|spec| spec.ports.clone())
        );
        assert_eq!(harness.physical.actors(Op::Patch), vec![Harness::ADMIN]);
        assert_eq!(
            harness.virtual_cluster.actors(Op::Update),
            vec![Harness::ADMIN]
        );
    }

    #[tokio::test]
    async fn same_type_updates_virtual_service_only() {
        let harness = Harness::new();
        let existing = external_name_pair(&harness, "web", "frontend");

        let mut request = existing.clone();
        request.spec.get_or_insert_default().external_name = Some("example.org".to_owned());

        let updated = harness
            .redirect
            .update(harness.user_client(), &existing, &Harness::body(&request))
            .await
            .expect("update succeeds");

        assert_eq!(service_type(&updated), EXTERNAL_NAME);
        assert!(harness.physical.calls().is_empty());
        assert_eq!(
            harness.virtual_cluster.actors(Op::Update),
            vec![Harness::USERNAME]
        );
    }

    #[tokio::test]
    async fn requests_with_cluster_ip_update_virtual_service_only() {
        let harness = Harness::new();
        let existing = external_name_pair(&harness, "web", "frontend");

        let mut request = service("web", "frontend", "ClusterIP");
        request.metadata.resource_version = existing.metadata.resource_version.clone();
        request.spec.get_or_insert_default().cluster_ip = Some("10.0.0.42".to_owned());

        harness
            .redirect
            .update(harness.user_client(), &existing, &Harness::body(&request))
            .await
            .expect("update succeeds");

        assert!(harness.physical.calls().is_empty());
    }

    #[tokio::test]
    async fn stale_updates_are_left_to_the_virtual_cluster() {
        let harness = Harness::new();
        let existing = external_name_pair(&harness, "web", "frontend");

        let mut request = service("web", "frontend", "ClusterIP");
        request.metadata.resource_version = Some("1".to_owned());

        let error = harness
            .redirect
            .update(harness.user_client(), &existing, &Harness::body(&request))
            .await
            .expect_err("stale update fails");

        assert_eq!(error.status().code, 409);
        assert!(harness.physical.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_physical_service_is_not_found_on_the_virtual_name() {
        let harness = Harness::new();
        let existing = external_name_pair(&harness, "web", "frontend");
        harness
            .physical
            .remove(TARGET_NAMESPACE, "frontend-x-web-x-vcluster");

        let mut request = service("web", "frontend", "ClusterIP");
        request.metadata.resource_version = existing.metadata.resource_version.clone();

        let status = harness
            .redirect
            .update(harness.user_client(), &existing, &Harness::body(&request))
            .await
            .expect_err("update fails")
            .status();

        assert_eq!(status.code, 404);
        assert_eq!(status.message, "services \"frontend\" not found");
        assert!(harness.virtual_cluster.actors(Op::Update).is_empty());
    }

    #[tokio::test]
    async fn failed_physical_patch_leaves_both_services() {
        let harness = Harness::new();
        let existing = external_name_pair(&harness, "web", "frontend");
        harness.physical.fail(
            Op::Patch,
            ApiStatus::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Invalid",
                "Service \"frontend-x-web-x-vcluster\" is invalid: spec.ports: Required value",
            )
            .with_details("services", "frontend-x-web-x-vcluster"),
        );

        let mut request = service("web", "frontend", "ClusterIP");
        request.metadata.resource_version = existing.metadata.resource_version.clone();

        let status = harness
            .redirect
            .update(harness.user_client(), &existing, &Harness::body(&request))
            .await
            .expect_err("update fails")
            .status();

        assert_eq!(status.code, 422);
        assert!(status.message.contains("frontend"));
        assert!(!status.message.contains("frontend-x-web-x-vcluster"));
        assert!(harness.virtual_cluster.actors(Op::Update).is_empty());
        assert!(harness.physical.actors(Op::Delete).is_empty());
        assert!(
            harness
                .physical
                .object(TARGET_NAMESPACE, "frontend-x-web-x-vcluster")
                .is_some()
        );
    }

    #[rstest]
    #[case::other_name("backend", "web", "the name of the object (backend) does not match the name on the URL (frontend)")]
    #[case::other_namespace("frontend", "shop", "the namespace of the provided object does not match the namespace sent on the request")]
    #[tokio::test]
    async fn rejects_objects_not_matching_the_url(
        #[case] name: &str,
        #[case] namespace: &str,
        #[case] message: &str,
    ) {
        let harness = Harness::new();
        let existing = external_name_pair(&harness, "web", "frontend");

        let mut request = service(namespace, name, "ClusterIP");
        request.metadata.resource_version = existing.metadata.resource_version.clone();

        let status = harness
            .redirect
            .update(harness.user_client(), &existing, &Harness::body(&request))
            .await
            .expect_err("update is rejected")
            .status();

        assert_eq!(status.code, 400);
        assert_eq!(status.message, message);
        assert!(harness.physical.calls().is_empty());
        assert!(harness.virtual_cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_virtual_update_removes_physical_service() {
        let harness = Harness::new();
        let existing = external_name_pair(&harness, "web", "frontend");
        let rejected = ApiStatus::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Invalid",
            "Service \"frontend\" is invalid: spec.ports: Required value",
        );
        harness.virtual_cluster.fail(Op::Update, rejected.clone());

        let mut request = service("web", "frontend", "NodePort");
        request.metadata.resource_version = existing.metadata.resource_version.clone();

        let error = harness
            .redirect
            .update(harness.user_client(), &existing, &Harness::body(&request))
            .await
            .expect_err("update fails");

        assert_eq!(error.status(), rejected);
        assert!(
            harness
                .physical
                .object(TARGET_NAMESPACE, "frontend-x-web-x-vcluster")
                .is_none()
        );
    }

    #[tokio::test]
    async fn transition_completes_when_request_is_cancelled() {
        let harness = Harness::new();
        let existing = external_name_pair(&harness, "web", "frontend");
        let release = harness.virtual_cluster.hold(Op::Update);

        let mut request = service("web", "frontend", "ClusterIP");
        request.metadata.resource_version = existing.metadata.resource_version.clone();

        let redirect = harness.redirect.clone();
        let user_client = harness.user_client();
        let body = Harness::body(&request);
        let handler =
            tokio::spawn(async move { redirect.update(user_client, &existing, &body).await });

        harness.virtual_cluster.wait_for_call(Op::Update).await;
        handler.abort();
        let _ = handler.await;
        release.notify_one();

        harness
            .virtual_cluster
            .wait_for_object("web", "frontend", |service| {
                service_type(service) == "ClusterIP" && cluster_ip(service).is_some()
            })
            .await;
        assert!(
            harness
                .physical
                .object(TARGET_NAMESPACE, "frontend-x-web-x-vcluster")
                .is_some()
        );
    }
}
