//! Signed records, validation policy, and the local record store.
//!
//! Record legitimacy is delegated: a [`Validator`] decides whether a payload
//! is acceptable for its key namespace, and a [`Selector`] picks the best of
//! several valid records. Both are registered per key prefix (the `pk`
//! namespace ships built in). The store itself sits on a [`Datastore`] port;
//! writes go through synchronously and stale entries are discarded on read.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{KadError, Result};
use crate::id::PeerId;

/// Namespace for public-key records: `/pk/<peer-id-bytes>`.
pub const PK_NAMESPACE: &[u8] = b"/pk/";

/// Hard cap on entries the in-memory datastore will hold.
const MEMORY_STORE_MAX_ENTRIES: usize = 100_000;

/// A key/value record replicated through the DHT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Peer that authored the record, when known.
    pub author: Option<PeerId>,
    /// Signature over key and value; verification is the author's
    /// validator's concern, not the store's.
    pub signature: Option<Vec<u8>>,
    pub time_received: DateTime<Utc>,
}

impl Record {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            author: None,
            signature: None,
            time_received: Utc::now(),
        }
    }

    pub fn with_author(mut self, author: PeerId) -> Self {
        self.author = Some(author);
        self
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.time_received)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// The peer id a public key maps to: the SHA-256 digest of the key bytes.
/// The multihash framing around the digest is the identity module's concern;
/// inside this crate the digest is the id.
pub fn peer_id_from_public_key(public_key: &[u8]) -> PeerId {
    use sha2::{Digest, Sha256};
    PeerId::from_bytes(Sha256::digest(public_key).to_vec())
}

/// Datastore key for a record key: `/<base32(key)>`, lowercase RFC4648
/// without padding.
pub fn record_key(key: &[u8]) -> String {
    let encoded = data_encoding::BASE32_NOPAD.encode(key).to_ascii_lowercase();
    format!("/{encoded}")
}

/// The datastore key for a peer's public-key record.
pub fn public_key_record_key(peer: &PeerId) -> Vec<u8> {
    let mut key = PK_NAMESPACE.to_vec();
    key.extend_from_slice(peer.as_bytes());
    key
}

/// Extract the peer id from a `/pk/<id>` key, if it is one.
pub fn parse_public_key_key(key: &[u8]) -> Option<PeerId> {
    let rest = key.strip_prefix(PK_NAMESPACE)?;
    if rest.is_empty() {
        return None;
    }
    Some(PeerId::from_bytes(rest.to_vec()))
}

/// The namespace of a key: the bytes between the leading `/` and the next
/// `/`. `/pk/<id>` → `pk`. Keys without a namespace have no validator and
/// are rejected on put.
pub fn key_namespace(key: &[u8]) -> Option<&[u8]> {
    let rest = key.strip_prefix(b"/")?;
    let end = rest.iter().position(|&b| b == b'/')?;
    if end == 0 {
        return None;
    }
    Some(&rest[..end])
}

/// Decides whether a payload is a legitimate record for a key in its
/// namespace.
pub trait Validator: Send + Sync {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// Picks the best of several records that all validated for the same key.
/// Must be deterministic in the record *set*: the winner may not depend on
/// input order.
pub trait Selector: Send + Sync {
    fn select(&self, key: &[u8], records: &[Record]) -> Result<usize>;
}

/// Validator for `/pk/<id>`: the stored value must be the public key whose
/// digest is the id in the key.
pub struct PublicKeyValidator;

impl Validator for PublicKeyValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let claimed = parse_public_key_key(key).ok_or(KadError::InvalidPublicKey)?;
        if peer_id_from_public_key(value) != claimed {
            return Err(KadError::InvalidPublicKey);
        }
        Ok(())
    }
}

/// Selector for `/pk/`: all valid records for a key are identical, so the
/// first wins.
pub struct PublicKeySelector;

impl Selector for PublicKeySelector {
    fn select(&self, _key: &[u8], records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Err(KadError::NotFound);
        }
        Ok(0)
    }
}

/// Selector that prefers the newest record, breaking ties on value bytes so
/// the choice is independent of input order.
pub struct LatestSelector;

impl Selector for LatestSelector {
    fn select(&self, _key: &[u8], records: &[Record]) -> Result<usize> {
        records
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.time_received
                    .cmp(&b.time_received)
                    .then_with(|| a.value.cmp(&b.value))
            })
            .map(|(idx, _)| idx)
            .ok_or(KadError::NotFound)
    }
}

/// Per-namespace validation and selection policy.
pub struct ValidatorRegistry {
    validators: HashMap<Vec<u8>, Arc<dyn Validator>>,
    selectors: HashMap<Vec<u8>, Arc<dyn Selector>>,
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            validators: HashMap::new(),
            selectors: HashMap::new(),
        };
        registry.register(b"pk", Arc::new(PublicKeyValidator), Arc::new(PublicKeySelector));
        registry
    }
}

impl ValidatorRegistry {
    pub fn register(
        &mut self,
        namespace: &[u8],
        validator: Arc<dyn Validator>,
        selector: Arc<dyn Selector>,
    ) {
        self.validators.insert(namespace.to_vec(), validator);
        self.selectors.insert(namespace.to_vec(), selector);
    }

    pub fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let ns = key_namespace(key)
            .ok_or_else(|| KadError::invalid_record(key, "key has no namespace"))?;
        let validator = self
            .validators
            .get(ns)
            .ok_or_else(|| KadError::invalid_record(key, "no validator for namespace"))?;
        validator.validate(key, value)
    }

    /// Index of the best record among `records`, all previously validated.
    pub fn select(&self, key: &[u8], records: &[Record]) -> Result<usize> {
        let ns = key_namespace(key)
            .ok_or_else(|| KadError::invalid_record(key, "key has no namespace"))?;
        let selector = self
            .selectors
            .get(ns)
            .ok_or_else(|| KadError::invalid_record(key, "no selector for namespace"))?;
        selector.select(key, records)
    }
}

/// Backing key/value store port. Keys are the `/<base32>` form, values are
/// serialized records. Implementations only need to be a dumb byte store.
pub trait Datastore: Send {
    fn put(&mut self, key: &str, value: Vec<u8>) -> Result<()>;
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&mut self, key: &str) -> Result<()>;
    fn keys(&self) -> Vec<String>;
}

/// Bounded in-memory datastore, the default backing for tests and
/// single-process deployments.
pub struct MemoryDatastore {
    entries: LruCache<String, Vec<u8>>,
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        let cap = NonZeroUsize::new(MEMORY_STORE_MAX_ENTRIES).expect("capacity must be non-zero");
        Self {
            entries: LruCache::new(cap),
        }
    }
}

impl Datastore for MemoryDatastore {
    fn put(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.put(key.to_string(), value);
        Ok(())
    }

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.entries.pop(key);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Local record store: validated, TTL-bounded, selector-arbitrated.
pub struct RecordStore {
    datastore: Box<dyn Datastore>,
    registry: Arc<ValidatorRegistry>,
    ttl: Duration,
    /// Record keys this node authored, re-put by the republish loop.
    local_keys: Vec<Vec<u8>>,
}

impl RecordStore {
    pub fn new(datastore: Box<dyn Datastore>, registry: Arc<ValidatorRegistry>, ttl: Duration) -> Self {
        Self {
            datastore,
            registry,
            ttl,
            local_keys: Vec::new(),
        }
    }

    /// Validate and store a record. When a valid record already exists for
    /// the key, the selector arbitrates and the loser is dropped; the store
    /// never holds a record the registry has not validated.
    pub fn put(&mut self, record: Record, local: bool) -> Result<()> {
        self.registry.validate(&record.key, &record.value)?;

        let key = record.key.clone();
        let winner = match self.get(&key)? {
            Some(existing) if existing.value != record.value => {
                let pair = [existing, record];
                let best = self.registry.select(&key, &pair)?;
                trace!(
                    key = %record_key(&key),
                    kept = best,
                    "selector arbitrated conflicting records"
                );
                pair.into_iter().nth(best).expect("selector index in range")
            }
            // Same value or nothing stored: the fresher copy wins outright.
            _ => record,
        };

        let framed = bincode::serialize(&winner)
            .map_err(|e| KadError::invalid_record(&key, format!("encode: {e}")))?;
        self.datastore.put(&record_key(&key), framed)?;

        if local && !self.local_keys.iter().any(|k| k == &key) {
            self.local_keys.push(key);
        }
        Ok(())
    }

    /// Fetch the record for a key. Expired or no-longer-valid entries are
    /// deleted and reported absent.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Record>> {
        let ds_key = record_key(key);
        let Some(bytes) = self.datastore.get(&ds_key)? else {
            return Ok(None);
        };

        let record: Record = match crate::messages::deserialize_bounded(&bytes) {
            Ok(record) => record,
            Err(err) => {
                debug!(key = %ds_key, error = %err, "dropping undecodable stored record");
                self.datastore.delete(&ds_key)?;
                return Ok(None);
            }
        };

        if record.age() > self.ttl {
            trace!(key = %ds_key, age_secs = record.age().as_secs(), "record expired");
            self.datastore.delete(&ds_key)?;
            return Ok(None);
        }

        if self.registry.validate(&record.key, &record.value).is_err() {
            debug!(key = %ds_key, "dropping stored record that no longer validates");
            self.datastore.delete(&ds_key)?;
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// Records this node authored, for the republish loop. Expired entries
    /// drop out of the list as a side effect.
    pub fn local_records(&mut self) -> Vec<Record> {
        let keys: Vec<Vec<u8>> = self.local_keys.clone();
        let mut records = Vec::with_capacity(keys.len());
        let mut live_keys = Vec::with_capacity(keys.len());
        for key in keys {
            if let Ok(Some(record)) = self.get(&key) {
                live_keys.push(key);
                records.push(record);
            }
        }
        self.local_keys = live_keys;
        records
    }

    /// Drop every expired record. Idempotent; driven by the cleanup loop.
    pub fn expire_sweep(&mut self) -> usize {
        let mut dropped = 0;
        for ds_key in self.datastore.keys() {
            let Ok(Some(bytes)) = self.datastore.get(&ds_key) else {
                continue;
            };
            let expired = match crate::messages::deserialize_bounded::<Record>(&bytes) {
                Ok(record) => record.age() > self.ttl,
                Err(_) => true,
            };
            if expired && self.datastore.delete(&ds_key).is_ok() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, "expired records swept");
        }
        dropped
    }
}
