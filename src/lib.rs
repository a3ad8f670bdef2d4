//! # Hydros
//!
//! A GitOps automation engine. Hydros watches declarative resources describing
//! how source repositories should be rendered, how images should be built and
//! replicated, how GitHub releases should be cut, and how pull requests should
//! be opened and merged, and drives each resource toward its declared state.
//!
//! The engine is organized as:
//!
//! 1. A controller [`Registry`](controller::Registry) and reconciliation
//!    [`Manager`](controller::Manager) that dispatch typed resources to
//!    pluggable reconcilers through a worker pool with per-resource
//!    coalescing.
//! 2. A GitOps renderer and fork-PR syncer that clone repositories, apply a
//!    deterministic KRM transformation pipeline, and publish the hydrated
//!    result in place or through a pull request.
//! 3. A pull-request lifecycle manager that creates, discovers, and merges
//!    PRs against GitHub, directly or via auto-merge and the merge queue.
//! 4. An image replicator that copies container images, digest-pinned with
//!    all their tags, across registries.

pub mod api;
pub mod cli;
pub mod controller;
pub mod git;
pub mod github;
pub mod krm;
pub mod observability;
pub mod reconcilers;
pub mod secrets;
pub mod server;

/// API group served by hydros resources.
pub const API_GROUP: &str = "hydros.dev";

/// Current API version for hydros resources.
pub const API_VERSION: &str = "hydros.dev/v1alpha1";
