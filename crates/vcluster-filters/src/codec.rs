//! Decoding of request bodies and content negotiated encoding of responses.
//!
//! Only JSON and YAML are supported. Errors are returned to clients as
//! Kubernetes `Status` objects ([`ApiStatus`]), so that `kubectl` and client
//! libraries can interpret them like errors returned by the API server.
use axum::response::{IntoResponse, Response};
use http::{
    HeaderMap, HeaderValue, StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
};
use k8s_openapi::api::core::v1::Service;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};

/// Request bodies larger than this are rejected. This matches the default
/// request size limit of the Kubernetes API server.
pub const MAX_BODY_SIZE: usize = 3 * 1024 * 1024;

#[derive(Debug, Snafu)]
pub enum DecodeError {
    #[snafu(display("failed to parse JSON body"))]
    ParseJson { source: serde_json::Error },

    #[snafu(display("failed to parse YAML body"))]
    ParseYaml { source: serde_yaml::Error },

    #[snafu(display("expected a v1 Service object, got {api_version}/{kind}"))]
    UnexpectedKind { api_version: String, kind: String },

    #[snafu(display("failed to decode Service object"))]
    IntoObject { source: serde_json::Error },
}

#[derive(Debug, Snafu)]
pub enum EncodeError {
    #[snafu(display("failed to serialize object as JSON"))]
    SerializeJson { source: serde_json::Error },

    #[snafu(display("failed to serialize object as YAML"))]
    SerializeYaml { source: serde_yaml::Error },
}

/// The media types objects can be decoded from and encoded to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    Json,
    Yaml,
}

impl MediaType {
    pub const fn mime(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Yaml => "application/yaml",
        }
    }

    fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/json" => Some(Self::Json),
            "application/yaml" => Some(Self::Yaml),
            _ => None,
        }
    }

    /// Determines the media type of a request body from its `Content-Type`
    /// header. A missing header defaults to JSON.
    ///
    /// Returns the offending content type if it is not supported.
    pub fn from_content_type(headers: &HeaderMap) -> Result<Self, String> {
        let Some(value) = headers.get(CONTENT_TYPE) else {
            return Ok(Self::Json);
        };

        let content_type = value.to_str().unwrap_or_default();
        Self::from_mime(&essence(content_type)).ok_or_else(|| content_type.to_owned())
    }

    /// Selects the response media type from the `Accept` header. Returns
    /// [`None`] if the client accepts none of the supported types.
    pub fn from_accept(headers: &HeaderMap) -> Option<Self> {
        let accept = headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");

        if accept.trim().is_empty() {
            return Some(Self::Json);
        }

        accept.split(',').map(essence).find_map(|mime| match mime.as_str() {
            "*/*" | "application/*" => Some(Self::Json),
            mime => Self::from_mime(mime),
        })
    }

    pub fn decode<T: DeserializeOwned>(self, body: &[u8]) -> Result<T, DecodeError> {
        let value: serde_json::Value = match self {
            Self::Json => serde_json::from_slice(body).context(ParseJsonSnafu)?,
            Self::Yaml => serde_yaml::from_slice(body).context(ParseYamlSnafu)?,
        };

        serde_json::from_value(value).context(IntoObjectSnafu)
    }

    pub fn encode<T: Serialize>(self, object: &T) -> Result<Vec<u8>, EncodeError> {
        match self {
            Self::Json => serde_json::to_vec(object).context(SerializeJsonSnafu),
            Self::Yaml => serde_yaml::to_string(object)
                .map(String::into_bytes)
                .context(SerializeYamlSnafu),
        }
    }
}

/// Returns the lower cased media type of a header value without parameters,
/// e.g. `application/json` for `application/json; charset=utf-8`.
fn essence(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

/// Decodes a request body into a [`Service`].
///
/// Bodies which declare a different `apiVersion` or `kind` are rejected. Both
/// fields are optional, like they are for the API server.
pub fn decode_service(media_type: MediaType, body: &[u8]) -> Result<Service, DecodeError> {
    let value: serde_json::Value = media_type.decode(body)?;

    let api_version = value.get("apiVersion").and_then(serde_json::Value::as_str);
    let kind = value.get("kind").and_then(serde_json::Value::as_str);
    if api_version.is_some_and(|v| v != "v1") || kind.is_some_and(|k| k != "Service") {
        return UnexpectedKindSnafu {
            api_version: api_version.unwrap_or_default(),
            kind: kind.unwrap_or_default(),
        }
        .fail();
    }

    serde_json::from_value(value).context(IntoObjectSnafu)
}

/// Details of an [`ApiStatus`], identifying the affected object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// A Kubernetes `meta.k8s.io/v1` `Status` object, which describes a failed
/// API request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStatus {
    pub kind: String,
    pub api_version: String,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    pub status: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,

    pub code: u16,
}

impl ApiStatus {
    pub fn new(code: StatusCode, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "Status".to_owned(),
            api_version: "v1".to_owned(),
            metadata: serde_json::Map::new(),
            status: "Failure".to_owned(),
            message: message.into(),
            reason: reason.into(),
            details: None,
            code: code.as_u16(),
        }
    }

    pub fn with_details(mut self, resource: impl Into<String>, name: impl Into<String>) -> Self {
        self.details = Some(StatusDetails {
            name: Some(name.into()),
            group: None,
            kind: Some(resource.into()),
        });
        self
    }

    /// `404 NotFound` for the object `name` of the given `resource`.
    pub fn not_found(resource: &str, name: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "NotFound",
            format!("{resource} \"{name}\" not found"),
        )
        .with_details(resource, name)
    }

    /// `409 Conflict` for the object `name` of the given `resource`.
    pub fn conflict(resource: &str, name: &str, cause: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "Conflict",
            format!("Operation cannot be fulfilled on {resource} \"{name}\": {cause}"),
        )
        .with_details(resource, name)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BadRequest", message)
    }

    pub fn not_acceptable() -> Self {
        Self::new(
            StatusCode::NOT_ACCEPTABLE,
            "NotAcceptable",
            "only the following media types are accepted: application/json, application/yaml",
        )
    }

    pub fn internal_error(cause: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            format!("Internal error occurred: {cause}"),
        )
    }

    /// The HTTP status code of this status, falling back to `500` for codes
    /// which are not valid HTTP status codes.
    pub fn http_status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Writes objects and [`ApiStatus`] errors using the media type negotiated
/// with the client.
#[derive(Clone, Copy, Debug)]
pub struct Responder {
    media_type: Option<MediaType>,
}

impl Responder {
    /// Negotiates the response media type from the request headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            media_type: MediaType::from_accept(headers),
        }
    }

    /// Responds with the serialized `object` and the given status code.
    pub fn object<T: Serialize>(self, code: StatusCode, object: &T) -> Response {
        let Some(media_type) = self.media_type else {
            return Self::not_acceptable();
        };

        match media_type.encode(object) {
            Ok(body) => encoded(code, media_type, body),
            Err(error) => {
                tracing::error!(%error, "failed to encode response object");
                let status = ApiStatus::internal_error(error);
                self.status(&status)
            }
        }
    }

    /// Responds with the given [`ApiStatus`].
    pub fn status(self, status: &ApiStatus) -> Response {
        let media_type = self.media_type.unwrap_or(MediaType::Json);

        match media_type.encode(status) {
            Ok(body) => encoded(status.http_status(), media_type, body),
            Err(error) => {
                tracing::error!(%error, "failed to encode status response");
                (StatusCode::INTERNAL_SERVER_ERROR, status.message.clone()).into_response()
            }
        }
    }

    /// Returns whether the client accepts any media type objects can be
    /// written in. Errors are always written, in JSON if nothing else fits.
    pub fn is_acceptable(&self) -> bool {
        self.media_type.is_some()
    }

    fn not_acceptable() -> Response {
        Self {
            media_type: Some(MediaType::Json),
        }
        .status(&ApiStatus::not_acceptable())
    }
}

fn encoded(code: StatusCode, media_type: MediaType, body: Vec<u8>) -> Response {
    (
        code,
        [(CONTENT_TYPE, HeaderValue::from_static(media_type.mime()))],
        body,
    )
        .into_response()
}
