//! Resource Client: the Kubernetes calls a reconcile pass makes
//!
//! The trait keeps the driver testable with mocks and an in-memory cluster.
//! The kube implementation bounds every call with a timeout and maps
//! 404/409 responses onto the error taxonomy the driver acts on.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::merge::IngressDelta;
use warden_common::crd::IdentityServer;
use warden_common::{Error, OPERATOR_NAME};

const INGRESS_KIND: &str = "Ingress";

/// What the guard check needs to know about the owning IdentityServer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentState {
    /// uid of the live object; differs if the server was deleted and recreated
    pub uid: Option<String>,
    /// `deletionTimestamp` is set
    pub deleting: bool,
}

/// Result of a delete call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The Ingress was deleted (or deletion was accepted)
    Deleted,
    /// There was nothing to delete
    NotFound,
}

/// Kubernetes operations on the managed Ingress and its owner
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IngressClient: Send + Sync {
    /// Read an Ingress by name; `None` when it does not exist
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error>;

    /// Create an Ingress; [`Error::Conflict`] when the name is taken
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress, Error>;

    /// Merge-patch an Ingress, conditioned on `expected_version` when given.
    ///
    /// Fails with [`Error::Conflict`] on a stale version and
    /// [`Error::NotFound`] when the Ingress is gone.
    async fn patch_ingress(
        &self,
        namespace: &str,
        name: &str,
        delta: &IngressDelta,
        expected_version: Option<String>,
    ) -> Result<Ingress, Error>;

    /// Delete an Ingress by name
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, Error>;

    /// Read the owning IdentityServer for the pre-write guard check
    async fn get_parent(&self, namespace: &str, name: &str) -> Result<Option<ParentState>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeIngressClient {
    client: Client,
    call_timeout: Duration,
}

impl KubeIngressClient {
    /// Wrap a client; every call is bounded by `call_timeout`
    pub fn new(client: Client, call_timeout: Duration) -> Self {
        Self {
            client,
            call_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<Result<T, kube::Error>, Error> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| Error::timeout(operation, self.call_timeout))
    }
}

fn api_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

/// Map 404/409 onto NotFound/Conflict; everything else stays a kube error
fn classify(error: kube::Error, name: &str) -> Error {
    match api_code(&error) {
        Some(409) => Error::conflict(INGRESS_KIND, name, error.to_string()),
        Some(404) => Error::not_found(INGRESS_KIND, name),
        _ => error.into(),
    }
}

#[async_trait]
impl IngressClient for KubeIngressClient {
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        match self.bounded("get_ingress", api.get(name)).await? {
            Ok(ingress) => Ok(Some(ingress)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress, Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let name = ingress.metadata.name.clone().unwrap_or_default();
        let params = PostParams {
            field_manager: Some(OPERATOR_NAME.to_string()),
            ..Default::default()
        };
        self.bounded("create_ingress", api.create(&params, ingress))
            .await?
            .map_err(|e| classify(e, &name))
    }

    async fn patch_ingress(
        &self,
        namespace: &str,
        name: &str,
        delta: &IngressDelta,
        expected_version: Option<String>,
    ) -> Result<Ingress, Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let patch = delta.to_merge_patch(expected_version.as_deref())?;
        debug!(ingress = %name, %patch, "patching ingress");
        self.bounded(
            "patch_ingress",
            api.patch(name, &PatchParams::apply(OPERATOR_NAME), &Patch::Merge(&patch)),
        )
        .await?
        .map_err(|e| classify(e, name))
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        match self
            .bounded("delete_ingress", api.delete(name, &DeleteParams::background()))
            .await?
        {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(classify(e, name)),
        }
    }

    async fn get_parent(&self, namespace: &str, name: &str) -> Result<Option<ParentState>, Error> {
        let api: Api<IdentityServer> = Api::namespaced(self.client.clone(), namespace);
        match self.bounded("get_parent", api.get(name)).await? {
            Ok(server) => Ok(Some(ParentState {
                uid: server.metadata.uid,
                deleting: server.metadata.deletion_timestamp.is_some(),
            })),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code,
        })
    }

    #[test]
    fn test_conflict_and_not_found_are_classified() {
        assert!(matches!(
            classify(api_error(409), "keycloak-ingress"),
            Error::Conflict { .. }
        ));
        assert!(matches!(
            classify(api_error(404), "keycloak-ingress"),
            Error::NotFound { .. }
        ));
        let err = classify(api_error(422), "keycloak-ingress");
        assert!(matches!(err, Error::Kube { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_conflict_names_the_ingress() {
        let err = classify(api_error(409), "keycloak-ingress");
        assert_eq!(err.resource(), Some("keycloak-ingress"));
        assert!(err.is_retryable());
    }
}
