//! Custom Resource Definitions for Warden

mod identity_server;
mod types;

pub use identity_server::{
    BackendOverride, HostnameSpec, HttpSpec, IdentityServer, IdentityServerSpec,
    IdentityServerStatus, IngressPhase, IngressSettings, IngressStatus, TypedBackendRef,
};
pub use types::{Condition, ConditionStatus};
