//! Ownership Merger
//!
//! Compares the desired shape with the observed Ingress and decides what to
//! write. Operator-owned fields are diffed and overwritten; labels and owner
//! references are only ever added to. A converged Ingress yields
//! [`Decision::NoOp`] so that passes without drift never write.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::networking::v1::{Ingress, IngressBackend, IngressRule};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::{json, Map, Value};

use crate::desired::{
    tracked_annotation_keys, Desired, DesiredShape, ManagedResourceRef,
    MANAGED_ANNOTATIONS_ANNOTATION,
};
use warden_common::Error;

/// What a reconcile pass should do with the managed Ingress
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Nothing to write
    NoOp,
    /// The Ingress is missing; create it in full
    Create(Box<Ingress>),
    /// The Ingress drifted; apply this delta
    Patch(IngressDelta),
    /// The Ingress is disabled and still exists
    Delete(ManagedResourceRef),
    /// The Ingress is terminating; wait for it to go away before recreating it
    AwaitDeletion,
    /// Disabled, but the Ingress under our name carries no owner reference to us
    LeaveUnowned(ManagedResourceRef),
}

impl Decision {
    /// Short label for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            Decision::NoOp => "noop",
            Decision::Create(_) => "create",
            Decision::Patch(_) => "patch",
            Decision::Delete(_) => "delete",
            Decision::AwaitDeletion => "await_deletion",
            Decision::LeaveUnowned(_) => "leave_unowned",
        }
    }

    /// Whether carrying out this decision writes to the cluster
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Decision::Create(_) | Decision::Patch(_) | Decision::Delete(_)
        )
    }
}

/// A drifted `spec.defaultBackend`
#[derive(Clone, Debug, PartialEq)]
pub struct BackendChange {
    /// Value to enforce
    pub desired: IngressBackend,
    /// Value currently on the cluster, needed to null out stray keys
    pub observed: Option<IngressBackend>,
}

/// The changes needed to bring an observed Ingress back to the desired shape
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IngressDelta {
    /// Owned annotations that are missing or hold another value
    pub annotations: BTreeMap<String, String>,
    /// Previously enforced annotations the IdentityServer no longer asks for
    pub removed_annotations: BTreeSet<String>,
    /// Identifying labels that are missing or hold another value
    pub labels: BTreeMap<String, String>,
    /// Full owner reference list (existing entries plus ours) when ours is missing
    pub owner_references: Option<Vec<OwnerReference>>,
    /// Backend drift
    pub default_backend: Option<BackendChange>,
    /// Replacement rules when they drifted
    pub rules: Option<Vec<IngressRule>>,
    /// Ingress class to enforce
    pub ingress_class_name: Option<String>,
}

impl IngressDelta {
    /// No field needs to change
    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
            && self.removed_annotations.is_empty()
            && self.labels.is_empty()
            && self.owner_references.is_none()
            && self.default_backend.is_none()
            && self.rules.is_none()
            && self.ingress_class_name.is_none()
    }

    /// The Ingress had no owner reference to us and is being taken over
    pub fn adopts(&self) -> bool {
        self.owner_references.is_some()
    }

    /// Names of the fields this delta touches, for logs and events
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if !self.annotations.is_empty() || !self.removed_annotations.is_empty() {
            fields.push("metadata.annotations");
        }
        if !self.labels.is_empty() {
            fields.push("metadata.labels");
        }
        if self.owner_references.is_some() {
            fields.push("metadata.ownerReferences");
        }
        if self.default_backend.is_some() {
            fields.push("spec.defaultBackend");
        }
        if self.rules.is_some() {
            fields.push("spec.rules");
        }
        if self.ingress_class_name.is_some() {
            fields.push("spec.ingressClassName");
        }
        fields
    }

    /// Render as a JSON merge patch (RFC 7386).
    ///
    /// Maps merge key by key, so unrelated annotations and labels survive.
    /// Lists replace wholesale, which is why owner references carry the full union.
    /// With `resource_version` set the API server rejects the patch with 409
    /// if the object changed since it was read.
    pub fn to_merge_patch(&self, resource_version: Option<&str>) -> Result<Value, Error> {
        let mut metadata = Map::new();
        if let Some(rv) = resource_version {
            metadata.insert("resourceVersion".to_string(), json!(rv));
        }
        if !self.annotations.is_empty() || !self.removed_annotations.is_empty() {
            let mut annotations = Map::new();
            for key in &self.removed_annotations {
                annotations.insert(key.clone(), Value::Null);
            }
            for (key, value) in &self.annotations {
                annotations.insert(key.clone(), json!(value));
            }
            metadata.insert("annotations".to_string(), Value::Object(annotations));
        }
        if !self.labels.is_empty() {
            metadata.insert("labels".to_string(), serde_json::to_value(&self.labels)?);
        }
        if let Some(owners) = &self.owner_references {
            metadata.insert("ownerReferences".to_string(), serde_json::to_value(owners)?);
        }

        let mut spec = Map::new();
        if let Some(change) = &self.default_backend {
            let desired = serde_json::to_value(&change.desired)?;
            let value = match &change.observed {
                Some(observed) => json_merge_diff(&serde_json::to_value(observed)?, &desired),
                None => desired,
            };
            spec.insert("defaultBackend".to_string(), value);
        }
        if let Some(rules) = &self.rules {
            spec.insert("rules".to_string(), serde_json::to_value(rules)?);
        }
        if let Some(class) = &self.ingress_class_name {
            spec.insert("ingressClassName".to_string(), json!(class));
        }

        let mut patch = Map::new();
        patch.insert("metadata".to_string(), Value::Object(metadata));
        if !spec.is_empty() {
            patch.insert("spec".to_string(), Value::Object(spec));
        }
        Ok(Value::Object(patch))
    }
}

/// Decide what to do with the managed Ingress.
///
/// `observed` is the Ingress read under the managed name. Anything with a
/// different name is discarded before comparison.
pub fn decide(desired: &Desired, observed: Option<&Ingress>) -> Decision {
    let target = desired.target();
    let observed = observed.filter(|ingress| target.matches(ingress));

    match (desired, observed) {
        (Desired::Disabled { .. }, None) => Decision::NoOp,
        (Desired::Disabled { .. }, Some(ingress)) if is_terminating(ingress) => Decision::NoOp,
        (Desired::Disabled { owner_uid, .. }, Some(ingress)) => {
            if is_owned_by(ingress, owner_uid) {
                Decision::Delete(target.clone())
            } else {
                Decision::LeaveUnowned(target.clone())
            }
        }
        (Desired::Present(shape), None) => Decision::Create(Box::new(shape.to_ingress())),
        (Desired::Present(_), Some(ingress)) if is_terminating(ingress) => Decision::AwaitDeletion,
        (Desired::Present(shape), Some(ingress)) => {
            let delta = diff(shape, ingress);
            if delta.is_empty() {
                Decision::NoOp
            } else {
                Decision::Patch(delta)
            }
        }
    }
}

/// Field-level diff of an existing Ingress against the desired shape
pub fn diff(shape: &DesiredShape, observed: &Ingress) -> IngressDelta {
    let meta = &observed.metadata;
    let spec = observed.spec.as_ref();

    let observed_backend = spec.and_then(|s| s.default_backend.clone());
    let default_backend = (observed_backend.as_ref() != Some(&shape.owned.default_backend))
        .then(|| BackendChange {
            desired: shape.owned.default_backend.clone(),
            observed: observed_backend,
        });

    let rules = (spec.and_then(|s| s.rules.as_ref()) != Some(&shape.owned.rules))
        .then(|| shape.owned.rules.clone());

    let observed_class = spec.and_then(|s| s.ingress_class_name.as_ref());
    let ingress_class_name = shape
        .owned
        .ingress_class_name
        .as_ref()
        .filter(|class| observed_class != Some(*class))
        .cloned();

    IngressDelta {
        annotations: missing_or_changed(&shape.owned.annotations, meta.annotations.as_ref()),
        removed_annotations: no_longer_requested(
            &shape.owned.annotations,
            meta.annotations.as_ref(),
        ),
        labels: missing_or_changed(&shape.extensible.labels, meta.labels.as_ref()),
        owner_references: owner_union(
            meta.owner_references.as_deref().unwrap_or_default(),
            &shape.extensible.owner_reference,
        ),
        default_backend,
        rules,
        ingress_class_name,
    }
}

/// Whether the Ingress carries an owner reference with the given uid
pub fn is_owned_by(ingress: &Ingress, owner_uid: &str) -> bool {
    ingress
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.uid == owner_uid)
}

fn is_terminating(ingress: &Ingress) -> bool {
    ingress.metadata.deletion_timestamp.is_some()
}

fn missing_or_changed(
    desired: &BTreeMap<String, String>,
    observed: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    desired
        .iter()
        .filter(|(key, value)| observed.and_then(|o| o.get(*key)) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Annotations we wrote earlier that the desired shape no longer carries.
///
/// Only keys listed in the observed tracking annotation are candidates, so
/// annotations added by anyone else are never removed.
fn no_longer_requested(
    desired: &BTreeMap<String, String>,
    observed: Option<&BTreeMap<String, String>>,
) -> BTreeSet<String> {
    let Some(observed) = observed else {
        return BTreeSet::new();
    };
    let mut removed: BTreeSet<String> = tracked_annotation_keys(observed)
        .into_iter()
        .filter(|key| !desired.contains_key(*key) && observed.contains_key(*key))
        .map(str::to_string)
        .collect();
    if observed.contains_key(MANAGED_ANNOTATIONS_ANNOTATION)
        && !desired.contains_key(MANAGED_ANNOTATIONS_ANNOTATION)
    {
        removed.insert(MANAGED_ANNOTATIONS_ANNOTATION.to_string());
    }
    removed
}

/// Existing owner references plus ours, or `None` when ours is already there.
///
/// Only one owner may be the controller, so ours is appended as a plain
/// owner when another controller reference exists.
fn owner_union(existing: &[OwnerReference], ours: &OwnerReference) -> Option<Vec<OwnerReference>> {
    if existing.iter().any(|owner| owner.uid == ours.uid) {
        return None;
    }
    let mut ours = ours.clone();
    if existing.iter().any(|owner| owner.controller == Some(true)) {
        ours.controller = Some(false);
    }
    let mut union = existing.to_vec();
    union.push(ours);
    Some(union)
}

/// Merge patch that turns `observed` into `desired` (RFC 7386 diff).
///
/// Keys present only in `observed` are set to null; nested objects recurse;
/// anything else is replaced.
pub fn json_merge_diff(observed: &Value, desired: &Value) -> Value {
    match (observed, desired) {
        (Value::Object(observed), Value::Object(desired)) => {
            let mut patch = Map::new();
            for (key, desired_value) in desired {
                match observed.get(key) {
                    Some(observed_value) if observed_value == desired_value => {}
                    Some(observed_value) => {
                        patch.insert(key.clone(), json_merge_diff(observed_value, desired_value));
                    }
                    None => {
                        patch.insert(key.clone(), desired_value.clone());
                    }
                }
            }
            for key in observed.keys() {
                if !desired.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}

/// Apply a JSON merge patch (RFC 7386) in place
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                apply_merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
