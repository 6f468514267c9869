//! IdentityServer CRD: a managed identity server exposed through an Ingress
//!
//! Only the fields that shape the Ingress live here. Everything else about
//! running the server is handled by other controllers.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::Error;

/// IdentityServer describes a managed identity server instance.
///
/// Example:
/// ```yaml
/// apiVersion: warden.dev/v1alpha1
/// kind: IdentityServer
/// metadata:
///   name: keycloak
/// spec:
///   hostname:
///     hostname: sso.example.com
///   ingress:
///     enabled: true
///     className: nginx
///     annotations:
///       nginx.ingress.kubernetes.io/proxy-buffer-size: 128k
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "warden.dev",
    version = "v1alpha1",
    kind = "IdentityServer",
    namespaced,
    status = "IdentityServerStatus",
    shortname = "ids",
    printcolumn = r#"{"name":"Hostname","type":"string","jsonPath":".spec.hostname.hostname"}"#,
    printcolumn = r#"{"name":"Ingress","type":"string","jsonPath":".status.ingress.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IdentityServerSpec {
    /// Ingress exposure. Absent means the ingress is enabled with defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSettings>,

    /// Public hostname of the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<HostnameSpec>,

    /// HTTP/TLS listener configuration of the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSpec>,
}

/// Ingress settings for an IdentityServer
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSettings {
    /// Whether the operator manages an Ingress for this server
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// IngressClass to bind to. When unset the field is left to the cluster default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// Extra annotations the operator enforces on the Ingress.
    /// The backend-protocol and termination annotations cannot be overridden.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Route traffic somewhere other than the server's own Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendOverride>,
}

fn default_enabled() -> bool {
    true
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            class_name: None,
            annotations: BTreeMap::new(),
            backend: None,
        }
    }
}

/// Custom backend selection. Exactly one of `serviceName` and `resource` must be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendOverride {
    /// Service to route to instead of `<name>-service`. The port stays operator-owned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Non-Service backend, such as a storage bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<TypedBackendRef>,
}

/// Reference to an arbitrary object serving as an Ingress backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypedBackendRef {
    /// API group of the referenced object; empty for the core group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,

    /// Kind of the referenced object
    pub kind: String,

    /// Name of the referenced object
    pub name: String,
}

/// Hostname configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostnameSpec {
    /// Host the Ingress rule matches. Unset means a catch-all rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Listener configuration of the identity server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpSpec {
    /// Secret holding the server's TLS certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,

    /// Serve plain HTTP
    #[serde(default)]
    pub http_enabled: bool,
}

/// IdentityServer status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityServerStatus {
    /// Outcome of the most recent ingress reconcile pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressStatus>,
}

/// Status of the managed Ingress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressStatus {
    /// Current phase
    #[serde(default)]
    pub phase: IngressPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation of the IdentityServer this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl IngressStatus {
    /// Create a status with the given phase
    pub fn with_phase(phase: IngressPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the observed generation
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Add a condition, replacing any existing condition of the same type
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}

/// Ingress reconcile phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum IngressPhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// The cluster matches the desired state
    Converged,
    /// A write was issued; the next pass confirms convergence
    Progressing,
    /// The last pass failed
    Error,
}

impl std::fmt::Display for IngressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Converged => write!(f, "Converged"),
            Self::Progressing => write!(f, "Progressing"),
            Self::Error => write!(f, "Error"),
        }
    }
}

impl IdentityServerSpec {
    /// Validate the ingress-related parts of the spec
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        if let Some(hostname) = self.hostname.as_ref().and_then(|h| h.hostname.as_deref()) {
            if hostname.trim().is_empty() {
                return Err(Error::validation_for_field(
                    name,
                    "spec.hostname.hostname",
                    "hostname must not be empty",
                ));
            }
        }

        let Some(ingress) = &self.ingress else {
            return Ok(());
        };

        if ingress.class_name.as_deref().is_some_and(str::is_empty) {
            return Err(Error::validation_for_field(
                name,
                "spec.ingress.className",
                "className must not be empty",
            ));
        }

        if let Some(backend) = &ingress.backend {
            match (&backend.service_name, &backend.resource) {
                (Some(_), Some(_)) => {
                    return Err(Error::validation_for_field(
                        name,
                        "spec.ingress.backend",
                        "serviceName and resource are mutually exclusive",
                    ))
                }
                (None, None) => {
                    return Err(Error::validation_for_field(
                        name,
                        "spec.ingress.backend",
                        "one of serviceName or resource must be set",
                    ))
                }
                (Some(service), None) if service.is_empty() => {
                    return Err(Error::validation_for_field(
                        name,
                        "spec.ingress.backend.serviceName",
                        "serviceName must not be empty",
                    ))
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl IdentityServer {
    /// Whether the operator should keep an Ingress for this server
    pub fn ingress_enabled(&self) -> bool {
        self.spec.ingress.as_ref().map_or(true, |i| i.enabled)
    }

    /// Explicit hostname, if any
    pub fn hostname(&self) -> Option<&str> {
        self.spec.hostname.as_ref()?.hostname.as_deref()
    }

    /// The server listens on plain HTTP only: no TLS secret and HTTP enabled
    pub fn is_http_only(&self) -> bool {
        self.spec
            .http
            .as_ref()
            .is_some_and(|h| h.tls_secret.is_none() && h.http_enabled)
    }

    /// Last reported ingress status
    pub fn ingress_status(&self) -> Option<&IngressStatus> {
        self.status.as_ref()?.ingress.as_ref()
    }
}
