//! kube-broker - Open Service Broker provisioning container services on
//! per-tenant Kubernetes clusters
//!
//! Given a filesystem catalog of parameterized Kubernetes manifests, the
//! broker provisions service instances on demand, renders their credentials
//! for consuming applications, tears them down on release, and garbage
//! collects tenant clusters once their last instance is gone.
//!
//! # Modules
//!
//! - [`catalog`] - catalog loading, blueprint/component model, manifest
//!   rendering, dynamic registration
//! - [`creator`] - tenant cluster directory over the external cluster-creator
//! - [`applier`] - Kubernetes resource creation/inspection/deletion per
//!   instance
//! - [`registry`] - Consul-style service registry (public visibility tags)
//! - [`credentials`] - bound-instance credential rendering
//! - [`broker`] - HTTP API, auth realms and the instance state machine
//! - [`progress`] - in-memory per-instance progress log
//! - [`reaper`] - empty-cluster garbage collection
//! - [`jobs`] - lifecycle-hook jobs and their completion poller
//! - [`config`] - environment-driven configuration
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod applier;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod creator;
pub mod credentials;
pub mod error;
pub mod jobs;
pub mod progress;
pub mod reaper;
pub mod registry;

pub use error::Error;

/// Result type alias using the broker error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
