use std::collections::BTreeMap;
use std::time::SystemTime;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use super::Resource;

/// Resource metadata common to every kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub expires: Option<SystemTime>,
    /// Backend revision the record was read at
    #[serde(default)]
    pub revision: u64,
}

/// Generic stored resource: a typed header plus opaque spec bytes.
///
/// `secrets` holds the secret-bearing part of the resource (keys, tokens,
/// certificates) and is cleared by [`Resource::without_secrets`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: String,
    #[serde(default)]
    pub sub_kind: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: Bytes,
    #[serde(default)]
    pub secrets: Option<Bytes>,
}

impl ResourceRecord {
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            metadata: Metadata {
                name: name.into(),
                ..Metadata::default()
            },
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

    pub fn with_label(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_spec(
        mut self,
        spec: impl Into<Bytes>,
    ) -> Self {
        self.spec = spec.into();
        self
    }

    pub fn with_secrets(
        mut self,
        secrets: impl Into<Bytes>,
    ) -> Self {
        self.secrets = Some(secrets.into());
        self
    }

    pub fn has_secrets(&self) -> bool {
        self.secrets.is_some()
    }
}

impl Resource for ResourceRecord {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn sub_kind(&self) -> &str {
        &self.sub_kind
    }

    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }

    fn without_secrets(&self) -> Option<Self> {
        self.secrets.as_ref()?;
        Some(Self {
            secrets: None,
            ..self.clone()
        })
    }
}
