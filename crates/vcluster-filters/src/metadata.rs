//! Translates the metadata of virtual cluster objects into metadata which is
//! suitable for objects created in the physical cluster.
use k8s_openapi::{api::core::v1::Service, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use snafu::{OptionExt, Snafu};

use crate::translate;

/// Label which records the virtual namespace of a physical object.
pub const NAMESPACE_LABEL: &str = "vcluster.loft.sh/namespace";

/// Label which records the virtual cluster instance managing a physical object.
pub const MANAGED_BY_LABEL: &str = "vcluster.loft.sh/managed-by";

/// Annotation which records the virtual name of a physical object.
pub const OBJECT_NAME_ANNOTATION: &str = "vcluster.loft.sh/object-name";

/// Annotation which records the virtual namespace of a physical object.
pub const OBJECT_NAMESPACE_ANNOTATION: &str = "vcluster.loft.sh/object-namespace";

#[derive(Debug, Snafu)]
pub enum MetadataError {
    #[snafu(display("object has no name"))]
    MissingName,

    #[snafu(display("object {name:?} has no namespace"))]
    MissingNamespace { name: String },
}

/// Produces the physical copy of a virtual object.
///
/// Implementations must be pure: the returned object identity may only depend
/// on the identity of the passed object and the target namespace.
pub trait MetadataTranslator: Send + Sync {
    /// Returns the name of the physical object backing the virtual object
    /// `name` in the virtual namespace `namespace`.
    fn physical_name(&self, name: &str, namespace: &str) -> String;

    fn translate(
        &self,
        target_namespace: &str,
        service: &Service,
    ) -> Result<Service, MetadataError>;
}

/// The default [`MetadataTranslator`].
///
/// Names are translated with [`translate::physical_name`], server-owned fields
/// are dropped and the virtual identity is recorded in labels and annotations.
#[derive(Clone, Debug)]
pub struct ObjectTranslator {
    suffix: String,
}

impl ObjectTranslator {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl MetadataTranslator for ObjectTranslator {
    fn physical_name(&self, name: &str, namespace: &str) -> String {
        translate::physical_name(name, namespace, &self.suffix)
    }

    fn translate(
        &self,
        target_namespace: &str,
        service: &Service,
    ) -> Result<Service, MetadataError> {
        let name = service.metadata.name.as_deref().context(MissingNameSnafu)?;
        let namespace = service
            .metadata
            .namespace
            .as_deref()
            .context(MissingNamespaceSnafu { name })?;

        let mut labels = service.metadata.labels.clone().unwrap_or_default();
        labels.insert(NAMESPACE_LABEL.to_owned(), namespace.to_owned());
        labels.insert(MANAGED_BY_LABEL.to_owned(), self.suffix.clone());

        let mut annotations = service.metadata.annotations.clone().unwrap_or_default();
        annotations.insert(OBJECT_NAME_ANNOTATION.to_owned(), name.to_owned());
        annotations.insert(OBJECT_NAMESPACE_ANNOTATION.to_owned(), namespace.to_owned());

        Ok(Service {
            metadata: ObjectMeta {
                name: Some(self.physical_name(name, namespace)),
                namespace: Some(target_namespace.to_owned()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            spec: service.spec.clone(),
            status: service.status.clone(),
        })
    }
}
