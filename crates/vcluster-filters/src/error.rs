use http::StatusCode;
use snafu::Snafu;

use crate::{
    client,
    codec::{ApiStatus, DecodeError, MAX_BODY_SIZE},
    critical::CriticalSectionError,
    metadata::MetadataError,
};

/// A result type alias with the [`FilterError`] type as the default error type.
pub type Result<T, E = FilterError> = std::result::Result<T, E>;

/// Errors returned by the Service redirect filter.
///
/// Every error is returned to the client as a single Kubernetes `Status`, see
/// [`FilterError::status`]. Names of physical objects never appear in it.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FilterError {
    #[snafu(display("request info is missing"))]
    MissingRequestInfo,

    #[snafu(display("user info is missing"))]
    MissingUserInfo,

    #[snafu(display("{message}"))]
    InvalidOptions { message: String },

    #[snafu(display("none of the accepted media types can be produced"))]
    NotAcceptable,

    #[snafu(display("unsupported media type {content_type:?}"))]
    UnsupportedMediaType { content_type: String },

    #[snafu(display("request body exceeds the maximum size of {MAX_BODY_SIZE} bytes"))]
    BodyTooLarge,

    #[snafu(display("failed to read request body"))]
    ReadBody { source: axum::Error },

    #[snafu(display("failed to decode request body"))]
    Decode { source: DecodeError },

    #[snafu(display("name or generateName is required"))]
    MissingName,

    #[snafu(display("error setting metadata"))]
    SetupMetadata { source: MetadataError },

    #[snafu(display("service {name} already exists in namespace {namespace}"))]
    AlreadyExists { name: String, namespace: String },

    #[snafu(display("service {name:?} not found"))]
    NotFound { name: String },

    #[snafu(display("failed to create client impersonating the requesting user"))]
    ImpersonateUser { source: client::Error },

    #[snafu(display("failed to {operation} the physical service of {name:?}"))]
    Physical {
        source: client::Error,
        operation: &'static str,
        name: String,
        physical_name: String,
    },

    #[snafu(display("failed to {operation} the virtual service {name:?}"))]
    Virtual {
        source: client::Error,
        operation: &'static str,
        name: String,
    },

    #[snafu(display("failed to redirect service update"))]
    CriticalSection { source: CriticalSectionError },
}

impl FilterError {
    /// Converts the error into the `Status` returned to the client.
    ///
    /// Errors returned by an API server are passed through with their code and
    /// reason. Physical object names in their messages are replaced with the
    /// virtual name.
    pub fn status(&self) -> ApiStatus {
        match self {
            Self::InvalidOptions { message } => ApiStatus::bad_request(message.clone()),
            Self::NotAcceptable => ApiStatus::not_acceptable(),
            Self::UnsupportedMediaType { .. } => ApiStatus::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UnsupportedMediaType",
                "the body of the request was in an unknown format - accepted media types include: application/json, application/yaml",
            ),
            Self::BodyTooLarge => ApiStatus::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "RequestEntityTooLarge",
                self.to_string(),
            ),
            Self::ReadBody { .. } => ApiStatus::bad_request(error_chain(self)),
            Self::Decode { source } => ApiStatus::bad_request(format!(
                "Service in version \"v1\" cannot be handled as a Service: {}",
                error_chain(source)
            )),
            Self::MissingName => ApiStatus::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Invalid",
                format!("Service \"\" is invalid: metadata.name: Required value: {self}"),
            ),
            Self::AlreadyExists { name, .. } => ApiStatus::conflict("services", name, self),
            Self::NotFound { name } => ApiStatus::not_found("services", name),
            Self::Physical {
                source,
                name,
                physical_name,
                ..
            } => match source.api_status() {
                Some(status) => hide_physical_name(status, physical_name, name),
                None => ApiStatus::internal_error(error_chain(self)),
            },
            Self::Virtual { source, .. } => source
                .api_status()
                .cloned()
                .unwrap_or_else(|| ApiStatus::internal_error(error_chain(self))),
            Self::MissingRequestInfo
            | Self::MissingUserInfo
            | Self::SetupMetadata { .. }
            | Self::ImpersonateUser { .. }
            | Self::CriticalSection { .. } => ApiStatus::internal_error(error_chain(self)),
        }
    }
}

fn hide_physical_name(status: &ApiStatus, physical_name: &str, name: &str) -> ApiStatus {
    let mut status = status.clone();
    status.message = status.message.replace(physical_name, name);
    if let Some(details) = &mut status.details {
        if details.name.as_deref() == Some(physical_name) {
            details.name = Some(name.to_owned());
        }
    }
    status
}

/// Joins the messages of `error` and all its sources with `: `.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
