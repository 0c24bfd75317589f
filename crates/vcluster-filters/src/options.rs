//! Contains available options to configure the [`ServiceRedirect`][crate::ServiceRedirect].

/// The namespace of the physical cluster physical Services are created in if
/// none is configured.
pub const DEFAULT_TARGET_NAMESPACE: &str = "default";

/// The instance suffix used for name translation if none is configured.
pub const DEFAULT_NAME_SUFFIX: &str = "vcluster";

/// Specifies the Service redirect options.
///
/// The [`Default`] implementation uses the `default` target namespace and
/// the `vcluster` instance suffix.
///
/// ### Example
///
/// ```
/// use vcluster_filters::ServiceRedirectOptions;
///
/// let options = ServiceRedirectOptions::builder()
///     .target_namespace("vcluster-my-team")
///     .name_suffix("my-team")
///     .build();
///
/// assert_eq!(options.target_namespace, "vcluster-my-team");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRedirectOptions {
    /// The physical namespace all physical Services are created in.
    pub target_namespace: String,

    /// Identifies this virtual cluster instance. It is part of every
    /// translated name, so multiple instances can share a target namespace.
    pub name_suffix: String,
}

impl Default for ServiceRedirectOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ServiceRedirectOptions {
    /// Returns the default [`ServiceRedirectOptionsBuilder`].
    pub fn builder() -> ServiceRedirectOptionsBuilder {
        ServiceRedirectOptionsBuilder::default()
    }
}

/// Selectively customizes [`ServiceRedirectOptions`].
///
/// Usually constructed by calling [`ServiceRedirectOptions::builder()`].
#[derive(Debug, Default)]
pub struct ServiceRedirectOptionsBuilder {
    target_namespace: Option<String>,
    name_suffix: Option<String>,
}

impl ServiceRedirectOptionsBuilder {
    /// Sets the physical namespace physical Services are created in.
    pub fn target_namespace(mut self, target_namespace: impl Into<String>) -> Self {
        self.target_namespace = Some(target_namespace.into());
        self
    }

    /// Sets the instance suffix used for name translation.
    pub fn name_suffix(mut self, name_suffix: impl Into<String>) -> Self {
        self.name_suffix = Some(name_suffix.into());
        self
    }

    /// Builds the final [`ServiceRedirectOptions`] by using default values
    /// for any not explicitly set option.
    pub fn build(self) -> ServiceRedirectOptions {
        ServiceRedirectOptions {
            target_namespace: self
                .target_namespace
                .unwrap_or_else(|| DEFAULT_TARGET_NAMESPACE.to_owned()),
            name_suffix: self
                .name_suffix
                .unwrap_or_else(|| DEFAULT_NAME_SUFFIX.to_owned()),
        }
    }
}
