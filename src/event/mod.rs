//! Event data model shared by the fanout, its watchers and the relay.
//!
//! Resources are handed around behind `Arc` and never mutated once built.
//! Redaction produces a separate projection through
//! [`Resource::without_secrets`] so that the original stays available to
//! watchers that asked for secrets.

mod record;
pub use record::*;


use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

/// Operation carried by an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    /// Sent once per watcher: every later event is delivered without a gap
    Init,
    /// Resource was created or updated
    Put,
    /// Resource was removed
    Delete,
}

impl fmt::Display for OpType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            OpType::Init => f.write_str("init"),
            OpType::Put => f.write_str("put"),
            OpType::Delete => f.write_str("delete"),
        }
    }
}

/// A keyed, optionally labelled resource routed by the fanout.
pub trait Resource: Send + Sync + 'static {
    /// Registry sharding key
    fn kind(&self) -> &str;

    fn sub_kind(&self) -> &str {
        ""
    }

    fn name(&self) -> &str;

    fn labels(&self) -> &BTreeMap<String, String>;

    /// Copy of this resource with every secret-bearing field cleared.
    ///
    /// Returns `None` when the resource carries no secrets, in which case the
    /// original is delivered to every watcher.
    fn without_secrets(&self) -> Option<Self>
    where
        Self: Sized,
    {
        None
    }
}

/// Event fanned out to watchers
#[derive(Debug)]
pub struct Event<R> {
    pub op: OpType,
    /// `None` for events that are not tied to a resource; those reach every watcher
    pub resource: Option<Arc<R>>,
}

// Manual impl: cloning only bumps the `Arc`, `R` itself need not be `Clone`.
impl<R> Clone for Event<R> {
    fn clone(&self) -> Self {
        Self {
            op: self.op,
            resource: self.resource.clone(),
        }
    }
}

impl<R: Resource> Event<R> {
    pub fn init() -> Self {
        Self {
            op: OpType::Init,
            resource: None,
        }
    }

    pub fn put(resource: R) -> Self {
        Self::shared(OpType::Put, Arc::new(resource))
    }

    pub fn delete(resource: R) -> Self {
        Self::shared(OpType::Delete, Arc::new(resource))
    }

    /// Event around a resource that is already shared
    pub fn shared(
        op: OpType,
        resource: Arc<R>,
    ) -> Self {
        Self {
            op,
            resource: Some(resource),
        }
    }

    /// Event without a resource, delivered to every registered watcher
    pub fn broadcast(op: OpType) -> Self {
        Self { op, resource: None }
    }

    pub fn kind(&self) -> Option<&str> {
        self.resource.as_deref().map(Resource::kind)
    }

    /// Secret-free projection of this event.
    ///
    /// Shares the original `Arc` when there is nothing to redact.
    pub fn without_secrets(&self) -> Self {
        match self.resource.as_deref().and_then(Resource::without_secrets) {
            Some(redacted) => Self {
                op: self.op,
                resource: Some(Arc::new(redacted)),
            },
            None => self.clone(),
        }
    }
}
