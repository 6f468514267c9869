//! Warden operator: controller wiring for the `warden-operator` binary

#![deny(missing_docs)]

pub mod controller_runner;
