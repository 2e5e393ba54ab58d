//! # Persistence Store
//!
//! Sessions remember the last request payload and headers per method, the
//! reflection metadata per server and the connection options, so a frontend
//! can restore a workspace exactly as the user left it.
//!
//! The [`Store`] trait abstracts the backing storage; the core only needs a
//! small string-keyed byte map. [`MemoryStore`] is a complete in-memory
//! implementation suitable for tests and ephemeral sessions.
use crate::BoxError;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
#[error("store operation failed: '{0}'")]
pub struct StoreError(#[from] pub BoxError);

/// A string-keyed byte map. Implementations must tolerate concurrent access;
/// calls come from async tasks but are expected to be quick and non-blocking.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Returns all entries whose key starts with `prefix`.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// Key for the persisted [`crate::options::ConnectionOptions`].
pub const OPTIONS_KEY: &str = "opts";

/// Key for the last request payload sent to `method` on `address`.
pub fn message_key(address: &str, method: &str) -> String {
    format!("msg_{}", fnv1a(&[address, method]))
}

/// Key for the last headers sent to `method` on `address`.
pub fn metadata_key(address: &str, method: &str) -> String {
    format!("md_{}", fnv1a(&[address, method]))
}

/// Key for the reflection metadata used against `address`.
pub fn reflection_metadata_key(address: &str) -> String {
    format!("rmd_{}", fnv1a(&[address]))
}

/// Key for the last selected method on `address`.
pub fn selection_key(address: &str) -> String {
    format!("sel_{}", fnv1a(&[address]))
}

// FNV-1a over the parts with a separator, so ("ab", "c") and ("a", "bc")
// hash differently.
fn fnv1a(parts: &[&str]) -> String {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for part in parts {
        for byte in part.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
        hash ^= u64::from(b'|');
        hash = hash.wrapping_mul(PRIME);
    }
    format!("{hash:016x}")
}

/// In-memory [`Store`] backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // A poisoned map is still a valid map.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .entries()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_keys_are_stable_and_distinct() {
        let a = message_key("localhost:50051", "/echo.EchoService/UnaryEcho");
        let b = message_key("localhost:50051", "/echo.EchoService/UnaryEcho");
        let c = message_key("localhost:50051", "/echo.EchoService/Inspect");
        let d = message_key("localhost:50052", "/echo.EchoService/UnaryEcho");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with("msg_"));
    }

    #[test]
    fn key_families_do_not_collide() {
        let msg = message_key("addr", "m");
        let md = metadata_key("addr", "m");
        assert_ne!(msg, md);
        assert_eq!(msg.trim_start_matches("msg_"), md.trim_start_matches("md_"));
    }

    #[test]
    fn part_boundaries_affect_the_hash() {
        assert_ne!(fnv1a(&["ab", "c"]), fnv1a(&["a", "bc"]));
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        store.set("msg_1", b"hello").unwrap();

        assert_eq!(store.get("msg_1").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get("msg_2").unwrap(), None);

        store.delete("msg_1").unwrap();
        assert_eq!(store.get("msg_1").unwrap(), None);
    }

    #[test]
    fn memory_store_lists_by_prefix() {
        let store = MemoryStore::new();
        store.set("msg_a", b"1").unwrap();
        store.set("msg_b", b"2").unwrap();
        store.set("md_a", b"3").unwrap();

        let listed = store.list_prefix("msg_").unwrap();
        assert_eq!(
            listed,
            vec![
                ("msg_a".to_string(), b"1".to_vec()),
                ("msg_b".to_string(), b"2".to_vec()),
            ]
        );
    }
}
