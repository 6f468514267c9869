//! Controller runner - builds controller futures
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. This keeps controller construction pure and testable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use warden_common::crd::IdentityServer;
use warden_common::{LABEL_MANAGED_BY, OPERATOR_NAME};
use warden_ingress::{error_policy, reconcile, IngressContext, ReconcileConfig};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Settings for the ingress controller
#[derive(Clone, Debug, PartialEq)]
pub struct IngressControllerConfig {
    /// Namespace to watch; all namespaces when `None`
    pub watch_namespace: Option<String>,
    /// Maximum IdentityServers reconciled in parallel
    pub concurrency: u16,
    /// Quiet period that coalesces bursts of triggers for one server
    pub debounce: Duration,
    /// Per-pass deadlines and retry budgets
    pub reconcile: ReconcileConfig,
}

impl Default for IngressControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            concurrency: 4,
            debounce: Duration::from_millis(500),
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// Label selector matching Ingresses written by this operator
pub fn managed_ingress_selector() -> String {
    format!("{LABEL_MANAGED_BY}={OPERATOR_NAME}")
}

fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Build ingress controller futures (IdentityServer -> owned Ingress)
///
/// Changes to the IdentityServer and to any Ingress it owns both trigger a
/// pass. kube-runtime serializes passes per object and coalesces triggers
/// that arrive while one is running.
pub fn build_ingress_controllers(
    client: Client,
    config: IngressControllerConfig,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let namespace = config.watch_namespace.as_deref();
    let servers: Api<IdentityServer> = scoped_api(client.clone(), namespace);
    let ingresses: Api<Ingress> = scoped_api(client.clone(), namespace);
    let ctx = Arc::new(IngressContext::from_client(client, config.reconcile));

    match namespace {
        Some(ns) => tracing::info!(namespace = %ns, "- IdentityServer ingress controller"),
        None => tracing::info!("- IdentityServer ingress controller (all namespaces)"),
    }

    vec![Box::pin(
        Controller::new(servers, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .owns(
                ingresses,
                WatcherConfig::default()
                    .timeout(WATCH_TIMEOUT_SECS)
                    .labels(&managed_ingress_selector()),
            )
            .with_config(
                ControllerConfig::default()
                    .concurrency(config.concurrency)
                    .debounce(config.debounce),
            )
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("IdentityServer")),
    )]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
