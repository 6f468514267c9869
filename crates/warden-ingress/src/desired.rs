//! Desired State Builder
//!
//! Pure computation from an IdentityServer to the Ingress it should own.
//! The result separates fields the operator enforces from fields it only
//! adds to, because the merger treats the two sets differently.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::warn;

use warden_common::crd::{BackendOverride, IdentityServer};
use warden_common::{
    Error, APP_NAME, LABEL_APP, LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY, OPERATOR_NAME,
};

/// Suffix appended to the IdentityServer name to form the Ingress name
pub const INGRESS_SUFFIX: &str = "-ingress";

/// Suffix appended to the IdentityServer name to form the backend Service name
pub const SERVICE_SUFFIX: &str = "-service";

/// Port the server listens on for TLS traffic
pub const HTTPS_PORT: i32 = 8443;

/// Port the server listens on in HTTP-only mode
pub const HTTP_PORT: i32 = 8080;

/// Tells ingress-nginx which protocol to speak to the backend
pub const BACKEND_PROTOCOL_ANNOTATION: &str = "nginx.ingress.kubernetes.io/backend-protocol";

/// Tells the OpenShift router how to terminate TLS
pub const ROUTE_TERMINATION_ANNOTATION: &str = "route.openshift.io/termination";

/// Comma-separated keys of the IdentityServer-supplied annotations last
/// written to the Ingress. Keys dropped from the IdentityServer are removed
/// from the Ingress on the next pass.
pub const MANAGED_ANNOTATIONS_ANNOTATION: &str = "warden.dev/managed-annotations";

/// Value of the `app.kubernetes.io/component` label on the Ingress
pub const INGRESS_COMPONENT: &str = "ingress";

/// Path type of the single catch-all path
const PATH_TYPE: &str = "ImplementationSpecific";

/// How traffic reaches the server behind the Ingress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendProtocol {
    /// TLS all the way to the pod; the router passes the connection through
    Https,
    /// Plain HTTP to the pod; the router terminates TLS at the edge
    Http,
}

impl BackendProtocol {
    /// Protocol implied by the server's listener configuration
    pub fn for_server(server: &IdentityServer) -> Self {
        if server.is_http_only() {
            Self::Http
        } else {
            Self::Https
        }
    }

    /// Backend port enforced on the Ingress
    pub fn port(self) -> i32 {
        match self {
            Self::Https => HTTPS_PORT,
            Self::Http => HTTP_PORT,
        }
    }

    /// Value of [`BACKEND_PROTOCOL_ANNOTATION`]
    pub fn protocol_annotation(self) -> &'static str {
        match self {
            Self::Https => "HTTPS",
            Self::Http => "HTTP",
        }
    }

    /// Value of [`ROUTE_TERMINATION_ANNOTATION`]
    pub fn termination_annotation(self) -> &'static str {
        match self {
            Self::Https => "passthrough",
            Self::Http => "edge",
        }
    }
}

/// Identity of the one Ingress an IdentityServer owns.
///
/// Any Ingress with another name is foreign and never touched.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ManagedResourceRef {
    /// Namespace shared with the IdentityServer
    pub namespace: String,
    /// `<server>-ingress`
    pub name: String,
}

impl ManagedResourceRef {
    /// Ref for the Ingress owned by the named IdentityServer
    pub fn for_parent(namespace: &str, parent: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: format!("{parent}{INGRESS_SUFFIX}"),
        }
    }

    /// Whether the given Ingress is the one this ref names
    pub fn matches(&self, ingress: &Ingress) -> bool {
        ingress.metadata.name.as_deref() == Some(self.name.as_str())
            && ingress
                .metadata
                .namespace
                .as_deref()
                .map_or(true, |ns| ns == self.namespace)
    }
}

impl std::fmt::Display for ManagedResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Name of the Service fronting the named IdentityServer
pub fn backend_service_name(parent: &str) -> String {
    format!("{parent}{SERVICE_SUFFIX}")
}

/// Fields the operator enforces; any drift is overwritten
#[derive(Clone, Debug, PartialEq)]
pub struct OwnedFields {
    /// Annotation keys the operator owns, with their values
    pub annotations: BTreeMap<String, String>,
    /// `spec.defaultBackend`
    pub default_backend: IngressBackend,
    /// `spec.rules`
    pub rules: Vec<IngressRule>,
    /// `spec.ingressClassName`, enforced only when set
    pub ingress_class_name: Option<String>,
}

/// Fields the operator only adds to; unrelated keys are never removed
#[derive(Clone, Debug, PartialEq)]
pub struct ExtensibleFields {
    /// Identifying labels stamped by union
    pub labels: BTreeMap<String, String>,
    /// Controller reference appended to `metadata.ownerReferences`
    pub owner_reference: OwnerReference,
}

/// Full target state of the managed Ingress
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredShape {
    /// Which Ingress this is
    pub target: ManagedResourceRef,
    /// Operator-owned fields
    pub owned: OwnedFields,
    /// User-extensible fields
    pub extensible: ExtensibleFields,
}

impl DesiredShape {
    /// uid of the owning IdentityServer
    pub fn owner_uid(&self) -> &str {
        &self.extensible.owner_reference.uid
    }

    /// Materialize the complete Ingress object for creation
    pub fn to_ingress(&self) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(self.target.name.clone()),
                namespace: Some(self.target.namespace.clone()),
                labels: Some(self.extensible.labels.clone()),
                annotations: Some(self.owned.annotations.clone()),
                owner_references: Some(vec![self.extensible.owner_reference.clone()]),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                default_backend: Some(self.owned.default_backend.clone()),
                rules: Some(self.owned.rules.clone()),
                ingress_class_name: self.owned.ingress_class_name.clone(),
                ..Default::default()
            }),
            status: None,
        }
    }
}

/// Outcome of the builder: keep an Ingress, or make sure there is none
#[derive(Clone, Debug, PartialEq)]
pub enum Desired {
    /// Ingress disabled: the managed name must not exist
    Disabled {
        /// Which Ingress must be absent
        target: ManagedResourceRef,
        /// uid of the IdentityServer; only an Ingress it owns is deleted
        owner_uid: String,
    },
    /// Ingress enabled with the given shape
    Present(Box<DesiredShape>),
}

impl Desired {
    /// The managed Ingress this outcome is about
    pub fn target(&self) -> &ManagedResourceRef {
        match self {
            Desired::Disabled { target, .. } => target,
            Desired::Present(shape) => &shape.target,
        }
    }

    /// uid of the owning IdentityServer
    pub fn owner_uid(&self) -> &str {
        match self {
            Desired::Disabled { owner_uid, .. } => owner_uid,
            Desired::Present(shape) => shape.owner_uid(),
        }
    }
}

/// Compute the desired Ingress for an IdentityServer.
///
/// Deterministic: identical input yields an identical (and identically
/// serialized) result.
pub fn build_desired(server: &IdentityServer) -> Result<Desired, Error> {
    let name = server.name_any();
    let namespace = server.namespace().ok_or_else(|| {
        Error::validation_for_field(&name, "metadata.namespace", "IdentityServer must be namespaced")
    })?;
    let owner_reference = server.controller_owner_ref(&()).ok_or_else(|| {
        Error::validation_for_field(&name, "metadata.uid", "IdentityServer has no uid")
    })?;
    let target = ManagedResourceRef::for_parent(&namespace, &name);

    if !server.ingress_enabled() {
        return Ok(Desired::Disabled {
            target,
            owner_uid: owner_reference.uid,
        });
    }

    server.spec.validate(&name)?;

    let protocol = BackendProtocol::for_server(server);
    let settings = server.spec.ingress.as_ref();
    let backend = desired_backend(
        &name,
        settings.and_then(|s| s.backend.as_ref()),
        protocol,
    );

    let rules = vec![IngressRule {
        host: server.hostname().map(str::to_string),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: PATH_TYPE.to_string(),
                backend: backend.clone(),
            }],
        }),
    }];

    let extra_annotations = settings.map(|s| &s.annotations);

    Ok(Desired::Present(Box::new(DesiredShape {
        target,
        owned: OwnedFields {
            annotations: desired_annotations(&name, extra_annotations, protocol),
            default_backend: backend,
            rules,
            ingress_class_name: settings.and_then(|s| s.class_name.clone()),
        },
        extensible: ExtensibleFields {
            labels: identifying_labels(&name),
            owner_reference,
        },
    })))
}

fn desired_backend(
    parent: &str,
    backend: Option<&BackendOverride>,
    protocol: BackendProtocol,
) -> IngressBackend {
    if let Some(resource) = backend.and_then(|b| b.resource.as_ref()) {
        return IngressBackend {
            resource: Some(TypedLocalObjectReference {
                api_group: resource.api_group.clone(),
                kind: resource.kind.clone(),
                name: resource.name.clone(),
            }),
            service: None,
        };
    }

    let service_name = backend
        .and_then(|b| b.service_name.clone())
        .unwrap_or_else(|| backend_service_name(parent));

    IngressBackend {
        resource: None,
        service: Some(IngressServiceBackend {
            name: service_name,
            port: Some(ServiceBackendPort {
                name: None,
                number: Some(protocol.port()),
            }),
        }),
    }
}

fn desired_annotations(
    parent: &str,
    extra: Option<&BTreeMap<String, String>>,
    protocol: BackendProtocol,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();

    for (key, value) in extra.into_iter().flatten() {
        if key == BACKEND_PROTOCOL_ANNOTATION
            || key == ROUTE_TERMINATION_ANNOTATION
            || key == MANAGED_ANNOTATIONS_ANNOTATION
        {
            warn!(
                server = %parent,
                annotation = %key,
                "ignoring override of an operator-enforced annotation"
            );
            continue;
        }
        annotations.insert(key.clone(), value.clone());
    }

    if !annotations.is_empty() {
        let tracked = annotations.keys().cloned().collect::<Vec<_>>().join(",");
        annotations.insert(MANAGED_ANNOTATIONS_ANNOTATION.to_string(), tracked);
    }

    annotations.insert(
        BACKEND_PROTOCOL_ANNOTATION.to_string(),
        protocol.protocol_annotation().to_string(),
    );
    annotations.insert(
        ROUTE_TERMINATION_ANNOTATION.to_string(),
        protocol.termination_annotation().to_string(),
    );
    annotations
}

/// Annotation keys recorded in the tracking annotation of `annotations`
pub fn tracked_annotation_keys(annotations: &BTreeMap<String, String>) -> Vec<&str> {
    annotations
        .get(MANAGED_ANNOTATIONS_ANNOTATION)
        .map(|keys| keys.split(',').filter(|key| !key.is_empty()).collect())
        .unwrap_or_default()
}

/// Labels identifying an Ingress as managed for the named server
pub fn identifying_labels(parent: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), APP_NAME.to_string()),
        (LABEL_MANAGED_BY.to_string(), OPERATOR_NAME.to_string()),
        (LABEL_INSTANCE.to_string(), parent.to_string()),
        (LABEL_COMPONENT.to_string(), INGRESS_COMPONENT.to_string()),
    ])
}
