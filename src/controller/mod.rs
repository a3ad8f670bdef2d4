//! # Controller registry and reconciliation manager
//!
//! The [`Registry`] maps `(apiVersion, kind)` to the reconciler for that
//! resource kind. The [`Manager`](manager::Manager) serializes per-resource
//! work through a worker pool: at most one reconcile runs per name at any
//! instant, and events enqueued while a reconcile is running coalesce to the
//! most recent one.

pub mod backoff;
pub mod dispatch;
pub mod manager;

pub use dispatch::ResourceDispatcher;
pub use manager::{Manager, NamedReconciler};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::api::{GroupVersionKind, RawResource};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("a reconciler for {0} is already registered")]
    DuplicateKind(GroupVersionKind),

    #[error("unsupported kind {0}")]
    UnsupportedKind(GroupVersionKind),

    #[error("a reconciler named {0:?} already exists")]
    DuplicateReconciler(String),

    #[error("no reconciler named {0:?}")]
    UnknownReconciler(String),

    #[error("manager is shutting down")]
    ShuttingDown,

    #[error("internal: {0}")]
    Internal(String),
}

/// Reconciles one resource kind. Each call receives the document pre-parsed
/// into the resource envelope; the reconciler decodes its typed shape.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The `(apiVersion, kind)` this reconciler handles.
    fn gvk(&self) -> GroupVersionKind;

    /// Drive one resource toward its declared state.
    async fn reconcile_node(&self, resource: &RawResource) -> anyhow::Result<()>;
}

/// Maps `(apiVersion, kind)` to reconcilers.
#[derive(Default)]
pub struct Registry {
    reconcilers: HashMap<GroupVersionKind, Arc<dyn Reconciler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reconciler under its kind.
    pub fn register(&mut self, reconciler: Arc<dyn Reconciler>) -> Result<(), ControllerError> {
        let gvk = reconciler.gvk();
        if self.reconcilers.contains_key(&gvk) {
            return Err(ControllerError::DuplicateKind(gvk));
        }
        self.reconcilers.insert(gvk, reconciler);
        Ok(())
    }

    /// The reconciler for a kind.
    pub fn get(&self, gvk: &GroupVersionKind) -> Result<Arc<dyn Reconciler>, ControllerError> {
        self.reconcilers
            .get(gvk)
            .cloned()
            .ok_or_else(|| ControllerError::UnsupportedKind(gvk.clone()))
    }

    pub fn kinds(&self) -> Vec<GroupVersionKind> {
        let mut kinds: Vec<_> = self.reconcilers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
