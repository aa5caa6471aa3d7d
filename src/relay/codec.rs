use std::sync::Arc;

use bytes::Bytes;
use bytes::BytesMut;

use crate::backend::BackendEvent;
use crate::backend::Item;
use crate::constants::KEY_SEPARATOR;
use crate::BackendError;
use crate::Event;
use crate::OpType;
use crate::Resource;
use crate::ResourceRecord;
use crate::Result;

/// Turns backend changes into fanout events
pub trait Codec<R: Resource>: Send + Sync + 'static {
    /// Returns `Ok(None)` for changes that do not map to a resource
    fn decode(
        &self,
        event: &BackendEvent,
    ) -> Result<Option<Event<R>>>;
}

/// Codec for [`ResourceRecord`]s stored under `/<kind>/<name>` keys with
/// `bincode` values.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordCodec;

impl RecordCodec {
    pub fn key(
        kind: &str,
        name: &str,
    ) -> Bytes {
        let mut key = BytesMut::with_capacity(kind.len() + name.len() + 2);
        key.extend_from_slice(&[KEY_SEPARATOR]);
        key.extend_from_slice(kind.as_bytes());
        key.extend_from_slice(&[KEY_SEPARATOR]);
        key.extend_from_slice(name.as_bytes());
        key.freeze()
    }

    /// Backend item holding `record`
    pub fn encode(record: &ResourceRecord) -> Result<Item> {
        let value = bincode::serialize(record).map_err(BackendError::from)?;
        let mut item = Item::new(Self::key(record.kind(), record.name()), value);
        item.expires = record.metadata.expires;
        Ok(item)
    }

    /// Splits a `/<kind>/<name>` key. The name is everything after the
    /// second separator and may itself contain separators.
    ///
    /// Returns `Ok(None)` for keys with another layout and an error for keys
    /// that are not valid UTF-8.
    pub fn split_key(key: &[u8]) -> Result<Option<(&str, &str)>> {
        let key = std::str::from_utf8(key)
            .map_err(|_| BackendError::InvalidKey(String::from_utf8_lossy(key).into_owned()))?;

        let mut parts = key.splitn(3, KEY_SEPARATOR as char);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(""), Some(kind), Some(name)) if !kind.is_empty() && !name.is_empty() => {
                Ok(Some((kind, name)))
            }
            _ => Ok(None),
        }
    }
}

impl Codec<ResourceRecord> for RecordCodec {
    fn decode(
        &self,
        event: &BackendEvent,
    ) -> Result<Option<Event<ResourceRecord>>> {
        if event.op == OpType::Init {
            return Ok(None);
        }
        let Some((kind, name)) = Self::split_key(&event.item.key)? else {
            return Ok(None);
        };

        let mut record = match event.op {
            OpType::Put => {
                let mut record: ResourceRecord =
                    bincode::deserialize(&event.item.value).map_err(BackendError::from)?;
                if record.kind != kind || record.metadata.name != name {
                    return Err(BackendError::InvalidKey(format!(
                        "record {}/{} stored under {}/{}",
                        record.kind, record.metadata.name, kind, name
                    ))
                    .into());
                }
                record.metadata.expires = event.item.expires;
                record
            }
            // deletes only carry the key
            _ => ResourceRecord::new(kind, name),
        };

        record.metadata.revision = event.item.revision;
        Ok(Some(Event::shared(event.op, Arc::new(record))))
    }
}
