//! Reconcile Driver for the IdentityServer Ingress
//!
//! Each pass recomputes everything from the current spec and the current
//! cluster state; nothing is remembered between passes. kube-runtime's
//! `Controller` guarantees at most one pass per IdentityServer at a time and
//! coalesces triggers, so this module only deals with a single pass:
//!
//! 1. build the desired shape (validation errors park the pass until the IdentityServer changes)
//! 2. read the managed Ingress, retrying transient failures in place
//! 3. decide, check the parent is still the one we reconcile, then write
//! 4. on an optimistic-concurrency conflict, re-read and decide again
//! 5. record the outcome in status
//!
//! The whole pass, status write included, runs under a deadline and is
//! requeued when it expires. Failed passes are requeued with a delay that
//! doubles while the same IdentityServer keeps failing.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use opentelemetry::KeyValue;
use tracing::{debug, error, info, instrument, warn};

use warden_common::crd::IdentityServer;
use warden_common::events::{actions, reasons, EventPublisher};
use warden_common::metrics::{
    INGRESS_DECISIONS, INGRESS_RECONCILE_DURATION, INGRESS_RECONCILE_ERRORS,
};
use warden_common::retry::{retry_transient, FailureBackoff};
use warden_common::{Error, KubeEventPublisher, OPERATOR_NAME};

use crate::client::{DeleteOutcome, IngressClient, KubeIngressClient};
use crate::config::ReconcileConfig;
use crate::desired::{build_desired, Desired, ManagedResourceRef};
use crate::merge::{decide, Decision, IngressDelta};
use crate::status::{is_status_unchanged, IngressOutcome, KubeStatusReporter, StatusReporter};

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for all reconcile passes; only the failure counts change
pub struct IngressContext {
    /// Cluster access for the Ingress and its owner
    pub client: Arc<dyn IngressClient>,
    /// Where pass outcomes are recorded
    pub status: Arc<dyn StatusReporter>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Deadlines and retry budgets
    pub config: ReconcileConfig,
    /// Consecutive failed passes per IdentityServer, for requeue backoff
    pub failures: FailureBackoff,
}

impl IngressContext {
    /// Create a context from explicit collaborators
    pub fn new(
        client: Arc<dyn IngressClient>,
        status: Arc<dyn StatusReporter>,
        events: Arc<dyn EventPublisher>,
        config: ReconcileConfig,
    ) -> Self {
        let failures = FailureBackoff::new(config.error_requeue, config.max_error_requeue);
        Self {
            client,
            status,
            events,
            config,
            failures,
        }
    }

    /// Create a context backed by a live Kubernetes client
    pub fn from_client(client: Client, config: ReconcileConfig) -> Self {
        Self::new(
            Arc::new(KubeIngressClient::new(client.clone(), config.call_timeout)),
            Arc::new(KubeStatusReporter::new(client.clone(), config.call_timeout)),
            Arc::new(KubeEventPublisher::new(client, OPERATOR_NAME)),
            config,
        )
    }
}

/// How a pass ended when it did not fail
#[derive(Debug, PartialEq)]
enum PassResult {
    /// Ran to completion with this outcome
    Completed(IngressOutcome),
    /// Stopped before writing because the parent went away or was replaced
    Aborted(&'static str),
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile the Ingress of one IdentityServer
///
/// When the deadline expires, an `Error` status is still attempted, bounded
/// by the per-call timeout.
#[instrument(skip(server, ctx), fields(server = %server.name_any(), namespace = ?server.namespace()))]
pub async fn reconcile(
    server: Arc<IdentityServer>,
    ctx: Arc<IngressContext>,
) -> Result<Action, Error> {
    if server.metadata.deletion_timestamp.is_some() {
        // Owner references let the garbage collector remove the Ingress
        debug!("identity server is being deleted, nothing to do");
        return Ok(Action::await_change());
    }

    let start = Instant::now();
    let result =
        match tokio::time::timeout(ctx.config.pass_deadline, reconcile_pass(&server, &ctx)).await {
            Ok(result) => result,
            Err(_) => {
                let err = Error::timeout("reconcile pass", ctx.config.pass_deadline);
                record_error_status(&server, &ctx, &err).await;
                Err(err)
            }
        };
    INGRESS_RECONCILE_DURATION.record(
        start.elapsed().as_secs_f64(),
        &[KeyValue::new(
            "result",
            if result.is_ok() { "success" } else { "error" },
        )],
    );

    if result.is_ok() {
        ctx.failures.reset(&failure_key(&server));
    }
    result
}

/// Error policy for the ingress controller
///
/// - Retryable errors (transient): requeue, starting at `error_requeue` and
///   doubling per consecutive failure up to `max_error_requeue`
/// - Non-retryable errors (permanent): await spec change
pub fn error_policy(server: Arc<IdentityServer>, error: &Error, ctx: Arc<IngressContext>) -> Action {
    INGRESS_RECONCILE_ERRORS.add(1, &[KeyValue::new("error_type", error.error_type())]);

    if !error.is_retryable() {
        error!(?error, server = %server.name_any(), retryable = false, "ingress reconciliation failed");
        return Action::await_change();
    }

    let delay = ctx.failures.next_delay(&failure_key(&server));
    error!(
        ?error,
        server = %server.name_any(),
        retryable = true,
        requeue_secs = delay.as_secs(),
        "ingress reconciliation failed"
    );
    Action::requeue(delay)
}

fn failure_key(server: &IdentityServer) -> String {
    format!("{}/{}", server.namespace().unwrap_or_default(), server.name_any())
}

/// Resync once converged, come back soon after a write
fn next_action(outcome: &IngressOutcome, config: &ReconcileConfig) -> Action {
    if matches!(outcome, IngressOutcome::Converged(_)) {
        Action::requeue(config.resync_interval)
    } else {
        Action::requeue(config.progress_requeue)
    }
}

async fn reconcile_pass(server: &IdentityServer, ctx: &IngressContext) -> Result<Action, Error> {
    match run_pass(server, ctx).await {
        Ok(PassResult::Completed(outcome)) => {
            update_status(server, ctx, &outcome).await?;
            Ok(next_action(&outcome, &ctx.config))
        }
        Ok(PassResult::Aborted(reason)) => {
            info!(reason, "pass aborted before writing");
            Ok(Action::await_change())
        }
        Err(e) if !e.is_retryable() => {
            warn!(error = %e, "ingress cannot be reconciled until the IdentityServer changes");
            if matches!(e, Error::Validation { .. }) {
                ctx.events
                    .publish(
                        &server.object_ref(&()),
                        EventType::Warning,
                        reasons::VALIDATION_FAILED,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
            }
            update_status(server, ctx, &IngressOutcome::Error(e.to_string())).await?;
            Ok(Action::await_change())
        }
        Err(e) => {
            record_error_status(server, ctx, &e).await;
            Err(e)
        }
    }
}

async fn run_pass(server: &IdentityServer, ctx: &IngressContext) -> Result<PassResult, Error> {
    let desired = build_desired(server)?;
    let target = desired.target();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let observed = read_observed(ctx, target).await?;
        let decision = decide(&desired, observed.as_ref());
        INGRESS_DECISIONS.add(1, &[KeyValue::new("decision", decision.label())]);
        debug!(decision = decision.label(), attempt, "ingress decision");

        match apply(server, ctx, &desired, decision, observed.as_ref()).await {
            Err(Error::Conflict { message, .. }) if attempt < ctx.config.max_conflict_attempts => {
                info!(attempt, %message, "ingress changed since it was read, recomputing");
            }
            Err(Error::NotFound { .. }) if attempt < ctx.config.max_conflict_attempts => {
                info!(attempt, "ingress disappeared since it was read, recomputing");
            }
            result => return result,
        }
    }
}

async fn read_observed(
    ctx: &IngressContext,
    target: &ManagedResourceRef,
) -> Result<Option<Ingress>, Error> {
    retry_transient(&ctx.config.read_retry, "get_ingress", || {
        ctx.client.get_ingress(&target.namespace, &target.name)
    })
    .await
}

/// Check the IdentityServer we are reconciling still exists as the same object.
///
/// Returns the reason to abort, if any.
async fn guard(server: &IdentityServer, ctx: &IngressContext) -> Result<Option<&'static str>, Error> {
    let namespace = server.namespace().unwrap_or_default();
    let parent = ctx.client.get_parent(&namespace, &server.name_any()).await?;

    Ok(match parent {
        None => Some("identity server no longer exists"),
        Some(parent) if parent.deleting => Some("identity server is being deleted"),
        Some(parent) if parent.uid != server.metadata.uid => Some("identity server was replaced"),
        Some(_) => None,
    })
}

async fn apply(
    server: &IdentityServer,
    ctx: &IngressContext,
    desired: &Desired,
    decision: Decision,
    observed: Option<&Ingress>,
) -> Result<PassResult, Error> {
    if decision.is_mutating() {
        if let Some(reason) = guard(server, ctx).await? {
            return Ok(PassResult::Aborted(reason));
        }
    }

    let target = desired.target();
    let outcome = match decision {
        Decision::NoOp => IngressOutcome::Converged(
            match desired {
                Desired::Disabled { .. } => "Ingress disabled",
                Desired::Present(_) => "Ingress converged",
            }
            .to_string(),
        ),
        Decision::Create(ingress) => {
            ctx.client.create_ingress(&target.namespace, &ingress).await?;
            info!(ingress = %target, "created ingress");
            publish(
                ctx,
                server,
                EventType::Normal,
                reasons::INGRESS_CREATED,
                actions::CREATE,
                format!("Created Ingress {}", target.name),
            )
            .await;
            IngressOutcome::Progressing("Ingress created".to_string())
        }
        Decision::Patch(delta) => {
            let expected_version = observed.and_then(|i| i.metadata.resource_version.clone());
            patch(server, ctx, target, &delta, expected_version).await?;
            IngressOutcome::Progressing("Ingress updated".to_string())
        }
        Decision::Delete(target) => {
            match ctx.client.delete_ingress(&target.namespace, &target.name).await? {
                DeleteOutcome::Deleted => {
                    info!(ingress = %target, "deleted disabled ingress");
                    publish(
                        ctx,
                        server,
                        EventType::Normal,
                        reasons::INGRESS_DELETED,
                        actions::DELETE,
                        format!("Deleted Ingress {}", target.name),
                    )
                    .await;
                    IngressOutcome::Progressing("Ingress deleted".to_string())
                }
                DeleteOutcome::NotFound => IngressOutcome::Converged("Ingress disabled".to_string()),
            }
        }
        Decision::AwaitDeletion => {
            debug!(ingress = %target, "ingress is terminating, waiting before recreating");
            IngressOutcome::Progressing("Waiting for the terminating Ingress to be removed".to_string())
        }
        Decision::LeaveUnowned(target) => {
            warn!(
                ingress = %target,
                "ingress disabled but the managed name holds an ingress we do not own, leaving it in place"
            );
            publish(
                ctx,
                server,
                EventType::Warning,
                reasons::INGRESS_LEFT_UNOWNED,
                actions::RECONCILE,
                format!("Ingress {} has no owner reference to this server", target.name),
            )
            .await;
            IngressOutcome::Converged(format!(
                "Ingress disabled; unowned Ingress {} left in place",
                target.name
            ))
        }
    };

    Ok(PassResult::Completed(outcome))
}

async fn patch(
    server: &IdentityServer,
    ctx: &IngressContext,
    target: &ManagedResourceRef,
    delta: &IngressDelta,
    expected_version: Option<String>,
) -> Result<(), Error> {
    let fields = delta.changed_fields().join(", ");
    if delta.adopts() {
        warn!(
            ingress = %target,
            adopted = true,
            "taking ownership of a same-named ingress without our owner reference"
        );
    }

    ctx.client
        .patch_ingress(&target.namespace, &target.name, delta, expected_version)
        .await?;
    info!(ingress = %target, fields = %fields, "corrected ingress drift");

    let reason = if delta.adopts() {
        reasons::INGRESS_ADOPTED
    } else {
        reasons::INGRESS_UPDATED
    };
    publish(
        ctx,
        server,
        EventType::Normal,
        reason,
        actions::PATCH,
        format!("Updated {fields} on Ingress {}", target.name),
    )
    .await;
    Ok(())
}

async fn publish(
    ctx: &IngressContext,
    server: &IdentityServer,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&server.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

// =============================================================================
// Status update helpers
// =============================================================================

/// Best-effort `Error` status for a failed pass, bounded by the per-call timeout
async fn record_error_status(server: &IdentityServer, ctx: &IngressContext, error: &Error) {
    let outcome = IngressOutcome::Error(error.to_string());
    match tokio::time::timeout(ctx.config.call_timeout, update_status(server, ctx, &outcome)).await
    {
        Ok(Ok(())) => {}
        Ok(Err(status_err)) => warn!(error = %status_err, "failed to record error status"),
        Err(_) => warn!("timed out recording error status"),
    }
}

/// Record the outcome, skipping the patch when status already matches
async fn update_status(
    server: &IdentityServer,
    ctx: &IngressContext,
    outcome: &IngressOutcome,
) -> Result<(), Error> {
    if is_status_unchanged(server, outcome) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    ctx.status.report(server, outcome).await
}
