//! In-process remote store.
//!
//! Stands in for Redis when it is disabled or unreachable. Compare-and-act
//! operations hold the `DashMap` shard lock for their whole duration, which
//! gives them the same atomicity the Lua scripts give on Redis, but only
//! within this process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{RemoteStore, deadline_after};
use crate::error::{CacheError, Result};

#[derive(Clone, Debug)]
enum SlotValue {
    Bytes(Vec<u8>),
    Hash(HashMap<String, String>),
}

#[derive(Clone, Debug)]
struct Slot {
    value: SlotValue,
    expires_at: Instant,
}

impl Slot {
    fn new(value: SlotValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: deadline_after(ttl),
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn holds(&self, expected: &str) -> bool {
        matches!(&self.value, SlotValue::Bytes(b) if b.as_slice() == expected.as_bytes())
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::Store(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

/// `DashMap`-backed store with per-key TTL.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys, expired ones excluded.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of `key`, `None` when absent or expired.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .filter(|slot| !slot.is_expired())
            .map(|slot| slot.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Look up a live slot, dropping it if it has expired.
    fn live(&self, key: &str) -> Option<Slot> {
        if let Some(slot) = self.entries.get(key) {
            if !slot.is_expired() {
                return Some(slot.clone());
            }
        }
        self.entries.remove_if(key, |_, slot| slot.is_expired());
        None
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn mode(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.live(key) {
            Some(Slot {
                value: SlotValue::Bytes(bytes),
                ..
            }) => Ok(Some(bytes)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Slot::new(SlotValue::Bytes(value.to_vec()), ttl),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, slot)| !slot.is_expired()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        match self.live(key) {
            Some(Slot {
                value: SlotValue::Hash(fields),
                ..
            }) => Ok(fields),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn hash_replace(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<()> {
        if fields.is_empty() {
            self.entries.remove(key);
            return Ok(());
        }
        self.entries.insert(
            key.to_string(),
            Slot::new(SlotValue::Hash(fields.clone()), ttl),
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let slot = Slot::new(SlotValue::Bytes(value.as_bytes().to_vec()), ttl);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_expired() {
                    existing.insert(slot);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, slot| !slot.is_expired() && slot.holds(expected))
            .is_some())
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        match self.entries.get_mut(key) {
            Some(mut slot) if !slot.is_expired() && slot.holds(expected) => {
                slot.expires_at = deadline_after(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
