//! Orchestrates the writes of a virtual Service and its physical counterpart.
//!
//! Physical Services are written first, because the physical cluster allocates
//! the ClusterIP which then is recorded on the virtual Service. When the
//! virtual write fails afterwards, the physical write is compensated by
//! deleting the physical Service again. See [`ServiceRedirect::create`] and
//! [`ServiceRedirect::update`].
use std::sync::Arc;

use axum::{body::Bytes, extract::Request};
use futures::TryStreamExt as _;
use http::header::CONTENT_LENGTH;
use k8s_openapi::api::core::v1::Service;
use snafu::{ResultExt as _, ensure};

use crate::{
    client::Clients,
    codec::{self, MAX_BODY_SIZE, MediaType},
    error::{BodyTooLargeSnafu, DecodeSnafu, ReadBodySnafu, Result, UnsupportedMediaTypeSnafu},
    metadata::{MetadataTranslator, ObjectTranslator},
    options::ServiceRedirectOptions,
};

mod create;
mod update;

/// The `spec.type` of Services which have no ClusterIP and therefore no
/// physical counterpart.
pub const EXTERNAL_NAME: &str = "ExternalName";

/// The `spec.type` Services default to.
pub const CLUSTER_IP: &str = "ClusterIP";

/// Redirects Service writes into the physical cluster.
///
/// Shared between all requests. Holds no per-request state.
pub struct ServiceRedirect {
    clients: Clients,
    translator: Arc<dyn MetadataTranslator>,
    target_namespace: String,
}

impl ServiceRedirect {
    /// Uses the [`ObjectTranslator`] with the configured instance suffix.
    pub fn new(clients: Clients, options: ServiceRedirectOptions) -> Self {
        Self {
            clients,
            translator: Arc::new(ObjectTranslator::new(options.name_suffix)),
            target_namespace: options.target_namespace,
        }
    }

    /// Replaces the metadata translation.
    pub fn with_translator(mut self, translator: Arc<dyn MetadataTranslator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn target_namespace(&self) -> &str {
        &self.target_namespace
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }
}

/// The still encoded Service of a request body.
#[derive(Clone, Debug)]
pub struct ServiceBody {
    pub media_type: MediaType,
    pub bytes: Bytes,
}

impl ServiceBody {
    pub fn new(media_type: MediaType, bytes: impl Into<Bytes>) -> Self {
        Self {
            media_type,
            bytes: bytes.into(),
        }
    }

    /// Reads the body of `request`, up to [`MAX_BODY_SIZE`] bytes.
    pub async fn read(request: Request) -> Result<Self> {
        let media_type = MediaType::from_content_type(request.headers())
            .map_err(|content_type| UnsupportedMediaTypeSnafu { content_type }.build())?;

        let content_length = request
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        ensure!(
            content_length.is_none_or(|length| length <= MAX_BODY_SIZE),
            BodyTooLargeSnafu
        );

        let mut body = request.into_body().into_data_stream();
        let mut bytes = Vec::with_capacity(content_length.unwrap_or_default());
        while let Some(chunk) = body.try_next().await.context(ReadBodySnafu)? {
            ensure!(bytes.len() + chunk.len() <= MAX_BODY_SIZE, BodyTooLargeSnafu);
            bytes.extend_from_slice(&chunk);
        }

        Ok(Self::new(media_type, bytes))
    }

    pub fn decode(&self) -> Result<Service> {
        codec::decode_service(self.media_type, &self.bytes).context(DecodeSnafu)
    }
}

/// Returns the `spec.type` of `service`, which defaults to `ClusterIP`.
pub fn service_type(service: &Service) -> &str {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        .unwrap_or(CLUSTER_IP)
}

fn cluster_ip(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}
