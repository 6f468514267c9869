//! Status Reporter: surfaces each pass's outcome on the IdentityServer

use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use warden_common::crd::{
    Condition, ConditionStatus, IdentityServer, IngressPhase, IngressStatus,
};
use warden_common::{Error, OPERATOR_NAME};

/// Condition type carried on `status.ingress.conditions`
pub const INGRESS_READY_CONDITION: &str = "IngressReady";

/// Outcome of one reconcile pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Nothing needed to change
    Converged(String),
    /// A write was issued, or we are waiting on the cluster
    Progressing(String),
    /// The pass failed; the message says why
    Error(String),
}

impl IngressOutcome {
    /// Phase recorded in status
    pub fn phase(&self) -> IngressPhase {
        match self {
            IngressOutcome::Converged(_) => IngressPhase::Converged,
            IngressOutcome::Progressing(_) => IngressPhase::Progressing,
            IngressOutcome::Error(_) => IngressPhase::Error,
        }
    }

    /// Human-readable message recorded in status
    pub fn message(&self) -> &str {
        match self {
            IngressOutcome::Converged(m)
            | IngressOutcome::Progressing(m)
            | IngressOutcome::Error(m) => m,
        }
    }

    /// Build the status block for this outcome
    pub fn to_status(&self, observed_generation: Option<i64>) -> IngressStatus {
        let (condition_status, reason) = match self {
            IngressOutcome::Converged(_) => (ConditionStatus::True, "Converged"),
            IngressOutcome::Progressing(_) => (ConditionStatus::False, "Progressing"),
            IngressOutcome::Error(_) => (ConditionStatus::False, "ReconcileError"),
        };
        IngressStatus::with_phase(self.phase())
            .message(self.message())
            .observed_generation(observed_generation)
            .condition(Condition::new(
                INGRESS_READY_CONDITION,
                condition_status,
                reason,
                self.message(),
            ))
    }
}

/// Records reconcile outcomes on the parent resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Write `outcome` to the server's status
    async fn report(&self, server: &IdentityServer, outcome: &IngressOutcome) -> Result<(), Error>;
}

/// Check if the recorded status already matches, to avoid an update loop.
///
/// `Condition::new()` stamps a fresh `lastTransitionTime`, so every patch
/// would differ and trigger another reconcile through the watch.
pub fn is_status_unchanged(server: &IdentityServer, outcome: &IngressOutcome) -> bool {
    server
        .ingress_status()
        .map(|s| {
            s.phase == outcome.phase()
                && s.message.as_deref() == Some(outcome.message())
                && s.observed_generation == server.metadata.generation
        })
        .unwrap_or(false)
}

/// Patches `status.ingress` through the status subresource
pub struct KubeStatusReporter {
    client: Client,
    call_timeout: Duration,
}

impl KubeStatusReporter {
    /// Create a reporter using the given client; each patch is bounded by `call_timeout`
    pub fn new(client: Client, call_timeout: Duration) -> Self {
        Self {
            client,
            call_timeout,
        }
    }
}

#[async_trait]
impl StatusReporter for KubeStatusReporter {
    async fn report(&self, server: &IdentityServer, outcome: &IngressOutcome) -> Result<(), Error> {
        let namespace = server.namespace().unwrap_or_default();
        let api: Api<IdentityServer> = Api::namespaced(self.client.clone(), &namespace);
        let status = outcome.to_status(server.metadata.generation);
        let status_patch = serde_json::json!({ "status": { "ingress": status } });

        let name = server.name_any();
        let params = PatchParams::apply(OPERATOR_NAME);
        let merge = Patch::Merge(&status_patch);
        let patch = api.patch_status(&name, &params, &merge);
        tokio::time::timeout(self.call_timeout, patch)
            .await
            .map_err(|_| Error::timeout("patch_status", self.call_timeout))??;

        Ok(())
    }
}
