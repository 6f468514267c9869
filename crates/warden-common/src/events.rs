//! Events attached to an IdentityServer when its Ingress changes
//!
//! Every create, patch, delete and adoption of the managed Ingress, plus
//! validation failures, is recorded against the IdentityServer so operators
//! see it in `kubectl describe identityserver <name>`. Publishing never fails
//! a pass: a rejected event is logged at `warn` and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for IdentityServer events; the driver holds it as `Arc<dyn EventPublisher>`
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `reason`/`action` (see [`reasons`] and [`actions`]) on the
    /// IdentityServer behind `resource_ref`, with `note` naming the Ingress
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through the API server, reporting as `warden-operator`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` fills the event's reporting controller; the pod name,
    /// when `POD_NAME` is set, identifies the replica
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Drops every event; used by the driver tests and the in-memory cluster
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, one per Ingress outcome (REASON column of `kubectl get events`)
pub mod reasons {
    /// The managed ingress did not exist and was created
    pub const INGRESS_CREATED: &str = "IngressCreated";
    /// Drift on an operator-owned field was corrected
    pub const INGRESS_UPDATED: &str = "IngressUpdated";
    /// A same-named ingress without our owner reference was taken over
    pub const INGRESS_ADOPTED: &str = "IngressAdopted";
    /// The ingress was removed because the feature is disabled
    pub const INGRESS_DELETED: &str = "IngressDeleted";
    /// A same-named ingress we do not own was left in place on disable
    pub const INGRESS_LEFT_UNOWNED: &str = "IngressLeftUnowned";
    /// The IdentityServer's ingress settings cannot be built into an Ingress
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// The API call behind an event (ACTION column)
pub mod actions {
    /// A pass that wrote nothing, or failed before writing
    pub const RECONCILE: &str = "Reconcile";
    /// Ingress create
    pub const CREATE: &str = "Create";
    /// Ingress merge patch
    pub const PATCH: &str = "Patch";
    /// Ingress delete
    pub const DELETE: &str = "Delete";
}
