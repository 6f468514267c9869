//! Convergence tests against an in-memory cluster
//!
//! `FakeCluster` stores Ingresses and IdentityServers in maps, applies merge
//! patches the way the API server does, and enforces `resourceVersion`
//! preconditions. Each test drives `reconcile` pass by pass, the same way the
//! controller would after watch events and requeues.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::runtime::controller::Action;
use kube::ResourceExt;

use warden_common::crd::{
    HostnameSpec, HttpSpec, IdentityServer, IdentityServerSpec, IdentityServerStatus,
    IngressPhase, IngressSettings,
};
use warden_common::NoopEventPublisher;
use warden_ingress::desired::{
    BACKEND_PROTOCOL_ANNOTATION, HTTPS_PORT, HTTP_PORT, MANAGED_ANNOTATIONS_ANNOTATION,
};
use warden_ingress::merge::{apply_merge_patch, is_owned_by};
use warden_ingress::{
    reconcile, DeleteOutcome, Error, IngressClient, IngressContext, IngressDelta, IngressOutcome,
    ParentState, ReconcileConfig, StatusReporter,
};

const NAMESPACE: &str = "sso";

// =============================================================================
// In-memory cluster
// =============================================================================

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct FakeCluster {
    ingresses: Mutex<BTreeMap<Key, Ingress>>,
    servers: Mutex<BTreeMap<Key, IdentityServer>>,
    version: AtomicU64,
    writes: AtomicUsize,
    /// Simulates another writer landing between our read and our next patch
    race_next_patch: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
}

impl FakeCluster {
    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn add_server(&self, name: &str, spec: IdentityServerSpec) {
        let mut server = IdentityServer::new(name, spec);
        server.metadata.namespace = Some(NAMESPACE.to_string());
        server.metadata.uid = Some(format!("{name}-uid"));
        server.metadata.generation = Some(1);
        self.servers
            .lock()
            .unwrap()
            .insert(key(NAMESPACE, name), server);
    }

    fn update_spec(&self, name: &str, update: impl FnOnce(&mut IdentityServerSpec)) {
        let mut servers = self.servers.lock().unwrap();
        let server = servers.get_mut(&key(NAMESPACE, name)).expect("server exists");
        update(&mut server.spec);
        server.metadata.generation = server.metadata.generation.map(|g| g + 1);
    }

    fn server(&self, name: &str) -> IdentityServer {
        self.servers.lock().unwrap()[&key(NAMESPACE, name)].clone()
    }

    fn ingress(&self, name: &str) -> Option<Ingress> {
        self.ingresses
            .lock()
            .unwrap()
            .get(&key(NAMESPACE, name))
            .cloned()
    }

    /// Write an Ingress the way a human with kubectl would
    fn put_ingress(&self, mut ingress: Ingress) {
        ingress.metadata.namespace = Some(NAMESPACE.to_string());
        ingress.metadata.resource_version = Some(self.next_version());
        let name = ingress.name_any();
        self.ingresses
            .lock()
            .unwrap()
            .insert(key(NAMESPACE, &name), ingress);
    }

    fn edit_ingress(&self, name: &str, edit: impl FnOnce(&mut Ingress)) {
        let mut ingress = self.ingress(name).expect("ingress exists");
        edit(&mut ingress);
        self.put_ingress(ingress);
    }

    fn remove_ingress(&self, name: &str) {
        self.ingresses.lock().unwrap().remove(&key(NAMESPACE, name));
    }
}

#[async_trait]
impl IngressClient for FakeCluster {
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error> {
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .ingresses
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress, Error> {
        let name = ingress.name_any();
        let mut ingresses = self.ingresses.lock().unwrap();
        if ingresses.contains_key(&key(namespace, &name)) {
            return Err(Error::conflict("Ingress", &name, "already exists"));
        }
        let mut created = ingress.clone();
        created.metadata.resource_version = Some(self.next_version());
        created.metadata.uid = Some(format!("{name}-ingress-uid"));
        ingresses.insert(key(namespace, &name), created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn patch_ingress(
        &self,
        namespace: &str,
        name: &str,
        delta: &IngressDelta,
        expected_version: Option<String>,
    ) -> Result<Ingress, Error> {
        let mut ingresses = self.ingresses.lock().unwrap();
        let current = ingresses
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::not_found("Ingress", name))?;

        if self.race_next_patch.swap(false, Ordering::SeqCst) {
            current.metadata.resource_version = Some(self.next_version());
        }
        if expected_version.is_some() && expected_version != current.metadata.resource_version {
            return Err(Error::conflict("Ingress", name, "the object has been modified"));
        }

        let mut value = serde_json::to_value(&*current)?;
        apply_merge_patch(&mut value, &delta.to_merge_patch(None)?);
        let mut patched: Ingress = serde_json::from_value(value)?;
        patched.metadata.resource_version = Some(self.next_version());
        *current = patched.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(patched)
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, Error> {
        match self.ingresses.lock().unwrap().remove(&key(namespace, name)) {
            Some(_) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn get_parent(&self, namespace: &str, name: &str) -> Result<Option<ParentState>, Error> {
        Ok(self
            .servers
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .map(|server| ParentState {
                uid: server.metadata.uid.clone(),
                deleting: server.metadata.deletion_timestamp.is_some(),
            }))
    }
}

#[async_trait]
impl StatusReporter for FakeCluster {
    async fn report(&self, server: &IdentityServer, outcome: &IngressOutcome) -> Result<(), Error> {
        let mut servers = self.servers.lock().unwrap();
        if let Some(stored) = servers.get_mut(&key(NAMESPACE, &server.name_any())) {
            stored.status = Some(IdentityServerStatus {
                ingress: Some(outcome.to_status(server.metadata.generation)),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Test Fixtures
// =============================================================================

fn context(cluster: &Arc<FakeCluster>, config: ReconcileConfig) -> Arc<IngressContext> {
    Arc::new(IngressContext::new(
        cluster.clone(),
        cluster.clone(),
        Arc::new(NoopEventPublisher),
        config,
    ))
}

/// Run one pass against the server as currently stored
async fn pass(cluster: &Arc<FakeCluster>, name: &str) -> Result<Action, Error> {
    let server = Arc::new(cluster.server(name));
    reconcile(server, context(cluster, ReconcileConfig::default())).await
}

/// Run passes until status reports convergence; returns the number of passes
async fn converge(cluster: &Arc<FakeCluster>, name: &str) -> usize {
    for passes in 1..=5 {
        pass(cluster, name).await.expect("pass should succeed");
        if phase(cluster, name) == Some(IngressPhase::Converged) {
            return passes;
        }
    }
    panic!("{name} did not converge within 5 passes");
}

fn phase(cluster: &FakeCluster, name: &str) -> Option<IngressPhase> {
    cluster.server(name).ingress_status().map(|s| s.phase)
}

fn status_message(cluster: &FakeCluster, name: &str) -> String {
    cluster
        .server(name)
        .ingress_status()
        .and_then(|s| s.message.clone())
        .unwrap_or_default()
}

fn backend_port(ingress: &Ingress) -> Option<i32> {
    ingress
        .spec
        .as_ref()?
        .default_backend
        .as_ref()?
        .service
        .as_ref()?
        .port
        .as_ref()?
        .number
}

fn unowned_ingress(name: &str) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(BTreeMap::from([(
                "owner".to_string(),
                "platform-team".to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn disable(spec: &mut IdentityServerSpec) {
    spec.ingress = Some(IngressSettings {
        enabled: false,
        ..Default::default()
    });
}

fn cluster_with(name: &str, spec: IdentityServerSpec) -> Arc<FakeCluster> {
    let cluster = Arc::new(FakeCluster::default());
    cluster.add_server(name, spec);
    cluster
}

// =============================================================================
// Convergence Stories
// =============================================================================

/// Story: a new server gets one Ingress, then passes stop writing
#[tokio::test]
async fn story_new_server_converges_then_goes_quiet() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());

    let passes = converge(&cluster, "keycloak").await;
    assert_eq!(passes, 2, "create, then confirm");
    assert_eq!(cluster.writes(), 1);

    let ingress = cluster.ingress("keycloak-ingress").expect("ingress created");
    assert_eq!(backend_port(&ingress), Some(HTTPS_PORT));
    assert!(is_owned_by(&ingress, "keycloak-uid"));
    assert_eq!(ingress.spec.as_ref().unwrap().rules.as_ref().unwrap()[0].host, None);

    for _ in 0..5 {
        let action = pass(&cluster, "keycloak").await.expect("pass");
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    }
    assert_eq!(cluster.writes(), 1, "converged passes never write");
}

/// Story: someone deletes the Ingress; the next pass recreates it
#[tokio::test]
async fn story_deleted_ingress_self_heals() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    converge(&cluster, "keycloak").await;

    cluster.remove_ingress("keycloak-ingress");
    pass(&cluster, "keycloak").await.expect("pass");

    let ingress = cluster.ingress("keycloak-ingress").expect("ingress recreated");
    assert_eq!(backend_port(&ingress), Some(HTTPS_PORT));
}

/// Story: Ingresses under other names are never read or written
#[tokio::test]
async fn story_foreign_ingress_is_isolated() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    cluster.put_ingress(unowned_ingress("team-portal"));
    let before = cluster.ingress("team-portal");

    converge(&cluster, "keycloak").await;
    cluster.update_spec("keycloak", disable);
    converge(&cluster, "keycloak").await;

    assert_eq!(cluster.ingress("team-portal"), before);
    assert!(cluster.ingress("keycloak-ingress").is_none());
}

/// Story: user annotations and labels survive any number of passes
#[tokio::test]
async fn story_user_metadata_survives_passes() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    converge(&cluster, "keycloak").await;

    cluster.edit_ingress("keycloak-ingress", |ingress| {
        ingress
            .annotations_mut()
            .insert("example.com/team".to_string(), "identity".to_string());
        ingress
            .labels_mut()
            .insert("cost-center".to_string(), "42".to_string());
    });
    let writes = cluster.writes();

    for _ in 0..10 {
        pass(&cluster, "keycloak").await.expect("pass");
    }

    let ingress = cluster.ingress("keycloak-ingress").unwrap();
    assert_eq!(
        ingress.annotations().get("example.com/team").map(String::as_str),
        Some("identity")
    );
    assert_eq!(ingress.labels().get("cost-center").map(String::as_str), Some("42"));
    assert_eq!(cluster.writes(), writes, "user additions are not drift");
}

/// Story: a hand-edited backend port is corrected without touching user keys
#[tokio::test]
async fn story_port_drift_is_corrected() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    converge(&cluster, "keycloak").await;

    cluster.edit_ingress("keycloak-ingress", |ingress| {
        ingress
            .annotations_mut()
            .insert("example.com/team".to_string(), "identity".to_string());
        let backend = ingress
            .spec
            .as_mut()
            .and_then(|s| s.default_backend.as_mut())
            .and_then(|b| b.service.as_mut())
            .and_then(|s| s.port.as_mut())
            .unwrap();
        backend.number = Some(80);
    });

    converge(&cluster, "keycloak").await;

    let ingress = cluster.ingress("keycloak-ingress").unwrap();
    assert_eq!(backend_port(&ingress), Some(HTTPS_PORT));
    assert_eq!(
        ingress.annotations().get("example.com/team").map(String::as_str),
        Some("identity")
    );
}

/// Story: a removed operator annotation is restored
#[tokio::test]
async fn story_removed_protocol_annotation_is_restored() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    converge(&cluster, "keycloak").await;

    cluster.edit_ingress("keycloak-ingress", |ingress| {
        ingress.annotations_mut().remove(BACKEND_PROTOCOL_ANNOTATION);
    });
    converge(&cluster, "keycloak").await;

    let ingress = cluster.ingress("keycloak-ingress").unwrap();
    assert_eq!(
        ingress.annotations().get(BACKEND_PROTOCOL_ANNOTATION).map(String::as_str),
        Some("HTTPS")
    );
}

/// Story: an annotation dropped from the IdentityServer disappears from the
/// Ingress, while annotations added by others stay
#[tokio::test]
async fn story_dropped_server_annotation_is_removed() {
    let cluster = cluster_with(
        "keycloak",
        IdentityServerSpec {
            ingress: Some(IngressSettings {
                annotations: BTreeMap::from([
                    ("example.com/rate-limit".to_string(), "100".to_string()),
                    ("example.com/waf".to_string(), "on".to_string()),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    converge(&cluster, "keycloak").await;
    cluster.edit_ingress("keycloak-ingress", |ingress| {
        ingress
            .annotations_mut()
            .insert("example.com/team".to_string(), "identity".to_string());
    });

    cluster.update_spec("keycloak", |spec| {
        if let Some(ingress) = spec.ingress.as_mut() {
            ingress.annotations.remove("example.com/waf");
        }
    });
    converge(&cluster, "keycloak").await;

    let ingress = cluster.ingress("keycloak-ingress").unwrap();
    let annotations = ingress.annotations();
    assert!(!annotations.contains_key("example.com/waf"));
    assert_eq!(
        annotations.get("example.com/rate-limit").map(String::as_str),
        Some("100")
    );
    assert_eq!(
        annotations.get("example.com/team").map(String::as_str),
        Some("identity")
    );

    cluster.update_spec("keycloak", |spec| {
        if let Some(ingress) = spec.ingress.as_mut() {
            ingress.annotations.clear();
        }
    });
    converge(&cluster, "keycloak").await;

    let ingress = cluster.ingress("keycloak-ingress").unwrap();
    let annotations = ingress.annotations();
    assert!(!annotations.contains_key("example.com/rate-limit"));
    assert!(!annotations.contains_key(MANAGED_ANNOTATIONS_ANNOTATION));
    assert!(annotations.contains_key("example.com/team"));
    assert!(annotations.contains_key(BACKEND_PROTOCOL_ANNOTATION));
}

/// Story: a hostname produces a host-matched rule
#[tokio::test]
async fn story_hostname_becomes_rule_host() {
    let cluster = cluster_with(
        "keycloak",
        IdentityServerSpec {
            hostname: Some(HostnameSpec {
                hostname: Some("foo.bar".to_string()),
            }),
            ..Default::default()
        },
    );
    converge(&cluster, "keycloak").await;

    let ingress = cluster.ingress("keycloak-ingress").unwrap();
    let rules = ingress.spec.unwrap().rules.unwrap();
    assert_eq!(rules[0].host.as_deref(), Some("foo.bar"));
}

/// Story: switching to HTTP-only moves the backend to the HTTP port
#[tokio::test]
async fn story_http_only_switch_moves_port() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    converge(&cluster, "keycloak").await;

    cluster.update_spec("keycloak", |spec| {
        spec.http = Some(HttpSpec {
            tls_secret: None,
            http_enabled: true,
        });
    });
    converge(&cluster, "keycloak").await;

    let ingress = cluster.ingress("keycloak-ingress").unwrap();
    assert_eq!(backend_port(&ingress), Some(HTTP_PORT));
    assert_eq!(
        ingress.annotations().get(BACKEND_PROTOCOL_ANNOTATION).map(String::as_str),
        Some("HTTP")
    );
}

/// Story: disabling removes our Ingress and nothing else
#[tokio::test]
async fn story_disable_removes_only_owned_ingress() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    converge(&cluster, "keycloak").await;
    cluster.put_ingress(unowned_ingress("keycloak-custom"));

    cluster.update_spec("keycloak", disable);
    converge(&cluster, "keycloak").await;

    let ingresses = cluster.ingresses.lock().unwrap();
    let owned = ingresses
        .values()
        .filter(|ingress| is_owned_by(ingress, "keycloak-uid"))
        .count();
    assert_eq!(owned, 0);
    assert_eq!(ingresses.len(), 1);
    assert!(ingresses.contains_key(&key(NAMESPACE, "keycloak-custom")));
}

/// Story: with the Ingress disabled, a hand-made Ingress under the managed
/// name is left alone and surfaced in status
#[tokio::test]
async fn story_disabled_leaves_unowned_same_name_ingress() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    cluster.update_spec("keycloak", disable);
    cluster.put_ingress(unowned_ingress("keycloak-ingress"));

    converge(&cluster, "keycloak").await;

    assert!(cluster.ingress("keycloak-ingress").is_some());
    assert_eq!(cluster.writes(), 0);
    assert!(status_message(&cluster, "keycloak").contains("unowned"));
}

/// Story: with the Ingress enabled, a same-named Ingress is adopted and
/// keeps its own metadata
#[tokio::test]
async fn story_enabled_adopts_same_name_ingress() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    let mut existing = unowned_ingress("keycloak-ingress");
    existing.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: "portal".to_string(),
        uid: "portal-uid".to_string(),
        controller: Some(true),
        ..Default::default()
    }]);
    cluster.put_ingress(existing);

    converge(&cluster, "keycloak").await;

    let ingress = cluster.ingress("keycloak-ingress").unwrap();
    let owners = ingress.metadata.owner_references.clone().unwrap();
    assert_eq!(owners.len(), 2);
    let ours = owners.iter().find(|o| o.uid == "keycloak-uid").unwrap();
    assert_eq!(ours.controller, Some(false), "only one controller reference allowed");
    assert_eq!(
        ingress.annotations().get("owner").map(String::as_str),
        Some("platform-team")
    );
    assert_eq!(backend_port(&ingress), Some(HTTPS_PORT));
}

/// Story: a concurrent writer invalidates our read; the pass re-reads and
/// patches against the new version
#[tokio::test]
async fn story_concurrent_writer_forces_reread() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    converge(&cluster, "keycloak").await;
    cluster.edit_ingress("keycloak-ingress", |ingress| {
        ingress.annotations_mut().remove(BACKEND_PROTOCOL_ANNOTATION);
    });

    cluster.race_next_patch.store(true, Ordering::SeqCst);
    pass(&cluster, "keycloak").await.expect("conflict is absorbed in-pass");

    let ingress = cluster.ingress("keycloak-ingress").unwrap();
    assert!(ingress.annotations().contains_key(BACKEND_PROTOCOL_ANNOTATION));
}

/// Story: two servers in one namespace each converge their own Ingress
#[tokio::test]
async fn story_servers_do_not_interfere() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    cluster.add_server("keycloak-staging", IdentityServerSpec::default());

    converge(&cluster, "keycloak").await;
    converge(&cluster, "keycloak-staging").await;
    cluster.update_spec("keycloak-staging", disable);
    converge(&cluster, "keycloak-staging").await;

    assert!(cluster.ingress("keycloak-ingress").is_some());
    assert!(cluster.ingress("keycloak-staging-ingress").is_none());
}

/// Story: a pass that outlives its deadline is abandoned and retried later
#[tokio::test(start_paused = true)]
async fn story_pass_deadline_abandons_slow_pass() {
    let cluster = cluster_with("keycloak", IdentityServerSpec::default());
    *cluster.read_delay.lock().unwrap() = Some(Duration::from_secs(120));

    let err = pass(&cluster, "keycloak").await.expect_err("deadline");
    assert!(matches!(err, Error::Timeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(cluster.writes(), 0);
    assert_eq!(phase(&cluster, "keycloak"), Some(IngressPhase::Error));
}
