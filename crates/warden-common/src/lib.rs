//! Common types for Warden: CRDs, errors, events, and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name the operator reports as field manager, event reporter, and `managed-by` label value
pub const OPERATOR_NAME: &str = "warden-operator";

/// API group of the Warden CRDs
pub const WARDEN_API_GROUP: &str = "warden.dev";

/// Standard label: application name
pub const LABEL_APP: &str = "app";

/// Value of the `app` label stamped on every managed resource
pub const APP_NAME: &str = "warden";

/// Standard label: which controller manages the resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard label: the IdentityServer instance the resource belongs to
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Standard label: the role of the resource within the instance
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
