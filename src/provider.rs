//! Local provider store: who claims to serve which content id.
//!
//! Entries pair a provider peer with an expiry; re-adding refreshes the
//! expiry. Reads never surface expired entries, and a periodic idempotent GC
//! removes them for good. The cid map is bounded so a flood of unique cids
//! cannot grow memory without limit.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::id::{Contact, PeerId};

/// Hard cap on distinct cids tracked; least recently touched fall out first.
const MAX_TRACKED_CIDS: usize = 65_536;

/// Providers tracked per cid. More adds than this evict the stalest entry.
const MAX_PROVIDERS_PER_CID: usize = 64;

struct ProviderEntry {
    contact: Contact,
    expires_at: Instant,
}

pub struct ProviderStore {
    entries: LruCache<Vec<u8>, Vec<ProviderEntry>>,
    ttl: Duration,
}

impl ProviderStore {
    pub fn new(ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(MAX_TRACKED_CIDS).expect("capacity must be non-zero");
        Self {
            entries: LruCache::new(cap),
            ttl,
        }
    }

    /// Register `provider` for `cid`. Idempotent: an existing entry gets its
    /// expiry pushed out and its contact info refreshed.
    pub fn add(&mut self, cid: &[u8], provider: Contact) {
        let expires_at = Instant::now() + self.ttl;
        let providers = self.entries.get_or_insert_mut(cid.to_vec(), Vec::new);

        if let Some(entry) = providers.iter_mut().find(|e| e.contact.peer == provider.peer) {
            entry.contact = provider;
            entry.expires_at = expires_at;
            return;
        }

        if providers.len() >= MAX_PROVIDERS_PER_CID {
            // Make room by dropping the entry closest to expiry.
            if let Some(pos) = providers
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(pos, _)| pos)
            {
                providers.swap_remove(pos);
            }
        }

        trace!(cid = %hex_prefix(cid), provider = %provider.peer, "provider added");
        providers.push(ProviderEntry {
            contact: provider,
            expires_at,
        });
    }

    /// Non-expired providers for `cid`, most recently refreshed last.
    pub fn providers(&mut self, cid: &[u8]) -> Vec<Contact> {
        let now = Instant::now();
        match self.entries.get(cid) {
            Some(providers) => providers
                .iter()
                .filter(|e| e.expires_at > now)
                .map(|e| e.contact.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Whether `peer` currently provides `cid`.
    pub fn contains(&mut self, cid: &[u8], peer: &PeerId) -> bool {
        let now = Instant::now();
        self.entries
            .get(cid)
            .is_some_and(|providers| providers.iter().any(|e| e.contact.peer == *peer && e.expires_at > now))
    }

    /// Drop expired entries and empty cid slots. Idempotent.
    pub fn gc(&mut self) -> usize {
        let now = Instant::now();
        let mut dropped = 0;
        let mut empty_cids = Vec::new();

        for (cid, providers) in self.entries.iter_mut() {
            let before = providers.len();
            providers.retain(|e| e.expires_at > now);
            dropped += before - providers.len();
            if providers.is_empty() {
                empty_cids.push(cid.clone());
            }
        }
        for cid in empty_cids {
            self.entries.pop(&cid);
        }

        if dropped > 0 {
            debug!(dropped, "provider entries expired");
        }
        dropped
    }

    /// Cids this node itself provides, for the republish loop.
    pub fn provided_by(&mut self, this_peer: &PeerId) -> Vec<Vec<u8>> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|(_, providers)| {
                providers
                    .iter()
                    .any(|e| e.contact.peer == *this_peer && e.expires_at > now)
            })
            .map(|(cid, _)| cid.clone())
            .collect()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(8)])
}
