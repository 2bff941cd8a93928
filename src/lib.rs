//! keel - distribution-aware cluster lifecycle runtime
//!
//! keel turns a declarative cluster description plus a self-contained
//! cluster image into a running Kubernetes-compatible cluster over SSH:
//! it stands up a private image registry, ships the image rootfs to every
//! host, bootstraps the chosen distribution on the first master, joins the
//! remaining masters and workers, scales the fleet in and out, upgrades it
//! in place, and resets it.
//!
//! # Architecture
//!
//! The [`engine::Engine`] is the only stateful component: it owns a
//! cluster's mutable state for the duration of one lifecycle call, guarded
//! by a per-cluster advisory lock. Everything else is either pure
//! (layouts, command planners) or owns exactly the resources it
//! provisioned, released on return (sessions, mounts, the registry).
//!
//! # Modules
//!
//! - [`cluster`] - the cluster description and its invariants
//! - [`engine`] - the lifecycle state machine (init, join, delete, upgrade, reset)
//! - [`distro`] - per-distribution command planners (kubeadm, k0s, k3s)
//! - [`exec`] - one-host SSH execution and the per-call session cache
//! - [`fanout`] - bounded parallel application of per-host tasks
//! - [`registry`] - the in-cluster image registry all nodes pull from
//! - [`mount`] - scoped cluster image mounting
//! - [`metadata`] - the authoritative cluster record on master0
//! - [`token`] - join token minting and distribution
//! - [`layout`] - canonical controller and on-host paths
//! - [`retry`] - backoff with jitter for transient failures
//! - [`error`] - structured error types with stable kind codes

#![cfg_attr(not(test), deny(missing_docs))]

pub mod cluster;
pub mod distro;
pub mod engine;
pub mod error;
pub mod exec;
pub mod fanout;
pub mod layout;
pub mod metadata;
pub mod mount;
pub mod registry;
pub mod retry;
pub mod token;

pub use error::{Error, Result};
