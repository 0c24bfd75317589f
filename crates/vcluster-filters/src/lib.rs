//! Request filters of a virtual Kubernetes control plane.
//!
//! A virtual cluster presents its own Kubernetes API, while the workloads and
//! the network objects backing it live in a single namespace of a real
//! ("physical") cluster. This crate contains the [`ServiceRedirectLayer`]. It
//! intercepts `create` and `update` requests for `Service` objects and writes
//! them to both clusters:
//!
//! 1. The physical Service is written first, so the physical cluster
//!    allocates the ClusterIP.
//! 2. The virtual Service is written with the allocated ClusterIP.
//! 3. If the virtual write fails, the physical write is compensated.
//!
//! All other requests are passed to the wrapped service unchanged.
//!
//! ### Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use axum::{Router, middleware};
//! use kube::Config;
//! use vcluster_filters::{
//!     ServiceRedirect, ServiceRedirectLayer, ServiceRedirectOptions,
//!     client::Clients,
//!     request::{FrontProxyHeaders, attach_request_context},
//! };
//!
//! # async fn docs() -> Result<(), Box<dyn std::error::Error>> {
//! let physical = Config::infer().await?;
//! let virtual_cluster = Config::infer().await?;
//! let clients = Clients::from_configs(physical, virtual_cluster, None)?;
//!
//! let options = ServiceRedirectOptions::builder()
//!     .target_namespace("vcluster-my-team")
//!     .build();
//! let redirect = Arc::new(ServiceRedirect::new(clients, options));
//!
//! let router: Router = Router::new()
//!     .fallback(|| async { "forwarded to the virtual API server" })
//!     .layer(ServiceRedirectLayer::new(redirect))
//!     .layer(middleware::from_fn_with_state(
//!         FrontProxyHeaders::default(),
//!         attach_request_context,
//!     ));
//! # Ok(())
//! # }
//! ```
pub mod client;
pub mod codec;
pub mod critical;
pub mod error;
pub mod filter;
pub mod metadata;
pub mod options;
pub mod request;
pub mod saga;
pub mod service;
pub mod translate;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::FilterError;
pub use filter::{Dispatch, ServiceRedirectLayer, ServiceRedirectService};
pub use options::ServiceRedirectOptions;
pub use service::{ServiceBody, ServiceRedirect};
