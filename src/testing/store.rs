//! In-memory storage collaborator for tests.

use crate::error::{Error, Result};
use crate::node::CommandHandler;
use crate::rpc::{Response, ResponseValue};
use crate::types::{Address, CacheName, Command, CommandKind};
use bytes::Bytes;
use dashmap::DashMap;

/// Executes data commands against a concurrent map.
#[derive(Debug, Default)]
pub struct MapStore {
    entries: DashMap<(CacheName, Bytes), Bytes>,
}

impl MapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cache: &CacheName, key: &[u8]) -> Option<Bytes> {
        self.entries
            .get(&(cache.clone(), Bytes::copy_from_slice(key)))
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, cache: &CacheName, key: &[u8]) -> bool {
        self.get(cache, key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl CommandHandler for MapStore {
    async fn handle(&self, _origin: Address, command: Command) -> Result<Response> {
        let value = match command.kind {
            CommandKind::Get { cache, key } => self
                .entries
                .get(&(cache, key))
                .map(|entry| entry.value().clone()),
            CommandKind::Put { cache, key, value } => self.entries.insert((cache, key), value),
            CommandKind::Remove { cache, key } => {
                self.entries.remove(&(cache, key)).map(|(_, value)| value)
            }
            CommandKind::Opaque { .. } => return Ok(Response::empty()),
            other => {
                return Err(Error::Internal(format!(
                    "store cannot execute {:?}",
                    other
                )))
            }
        };
        Ok(Response::Success(ResponseValue::Value(value)))
    }
}
