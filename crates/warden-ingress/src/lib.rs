//! Ingress convergence for IdentityServer resources
//!
//! A reconcile pass is a pure pipeline wrapped in I/O:
//!
//! 1. [`desired::build_desired`] turns the IdentityServer spec into the target
//!    shape of `<name>-ingress`, split into operator-owned and user-extensible fields.
//! 2. [`merge::decide`] compares that shape with the observed Ingress and picks
//!    one of no-op, create, patch, delete.
//! 3. [`controller::reconcile`] reads, decides, guards, writes, and reports status.
//!
//! Ownership is name-based: only the deterministic name is ever read or written,
//! so Ingresses created by humans under other names are never touched.

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod desired;
pub mod merge;
pub mod status;

pub use client::{DeleteOutcome, IngressClient, KubeIngressClient, ParentState};
pub use config::ReconcileConfig;
pub use controller::{error_policy, reconcile, IngressContext};
pub use desired::{build_desired, Desired, DesiredShape, ManagedResourceRef};
pub use merge::{decide, Decision, IngressDelta};
pub use status::{IngressOutcome, KubeStatusReporter, StatusReporter};
pub use warden_common::Error;
