//! Subscription filters.
//!
//! A [`WatchSpec`] lists one or more [`WatchKind`]s. The kind string routes the
//! subscription to a per-kind registry inside the fanout; the remaining
//! fields narrow down which events of that kind reach the watcher.

mod selector;
pub use selector::*;

#[cfg(test)]
mod watch_test;

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::Resource;

/// Filter term within a subscription
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchKind {
    /// Resource kind, also the registry sharding key
    pub kind: String,
    /// When set, the resource sub-kind must be equal
    #[serde(default)]
    pub sub_kind: String,
    /// When set, only the resource with this exact name matches
    #[serde(default)]
    pub name: String,
    /// Deliver the unredacted resource instead of its secret-free projection
    #[serde(default)]
    pub load_secrets: bool,
    /// Label selector, see [`LabelSelector`]
    #[serde(default)]
    pub filter: BTreeMap<String, String>,
}

impl WatchKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_sub_kind(
        mut self,
        sub_kind: impl Into<String>,
    ) -> Self {
        self.sub_kind = sub_kind.into();
        self
    }

    pub fn with_name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_load_secrets(
        mut self,
        load_secrets: bool,
    ) -> Self {
        self.load_secrets = load_secrets;
        self
    }

    pub fn with_filter(
        mut self,
        key: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        self.filter.insert(key.into(), expected.into());
        self
    }

    /// Checks the name and sub-kind constraints, then the label selector.
    ///
    /// The selector is passed in already compiled so that the fanout can cache
    /// it per registry entry; a compilation failure is reported by the caller.
    pub fn matches<R: Resource>(
        &self,
        selector: &LabelSelector,
        resource: &R,
    ) -> bool {
        if !self.name.is_empty() && self.name != resource.name() {
            return false;
        }
        if !self.sub_kind.is_empty() && self.sub_kind != resource.sub_kind() {
            return false;
        }
        selector.matches(resource.labels())
    }

    /// Compiles the label filter of this kind
    pub fn selector(&self) -> std::result::Result<LabelSelector, SelectorError> {
        LabelSelector::compile(&self.filter)
    }
}

/// A subscription request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSpec {
    /// Diagnostic name of the subscriber
    #[serde(default)]
    pub name: String,
    pub kinds: Vec<WatchKind>,
    /// Watcher queue capacity; 0 selects the fanout's configured default
    #[serde(default)]
    pub queue_size: usize,
}

impl WatchSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_kind(
        mut self,
        kind: WatchKind,
    ) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn with_queue_size(
        mut self,
        queue_size: usize,
    ) -> Self {
        self.queue_size = queue_size;
        self
    }
}
