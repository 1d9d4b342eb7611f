//! DHT configuration.
//!
//! Every recognized tuning knob lives here with the defaults the rest of the
//! crate assumes. All values can be overridden before the node is spawned;
//! they are fixed for the lifetime of a [`crate::dht::Dht`] instance.

use std::time::Duration;

/// Default replication factor and bucket size.
pub const DEFAULT_K: usize = 20;

/// Default number of disjoint lookup paths.
pub const DEFAULT_ALPHA: usize = 3;

/// Records older than this are discarded on read.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(36 * 60 * 60);

/// Provider advertisements expire this long after the last add.
pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Debug)]
pub struct Config {
    /// Bucket size and replication factor (`k`).
    pub k: usize,
    /// Number of disjoint query paths (`α`).
    pub alpha: usize,
    /// Per-path worker concurrency (`β`). `None` means `α`.
    pub beta: Option<usize>,
    /// Maximum age of a stored record.
    pub record_ttl: Duration,
    /// Maximum age of a provider advertisement.
    pub provider_ttl: Duration,
    /// Overall deadline for one iterative query.
    pub query_timeout: Duration,
    /// Deadline for a single request/response exchange.
    pub request_timeout: Duration,
    /// How often quiet buckets are probed with a random lookup.
    pub bucket_refresh_interval: Duration,
    /// How often locally authored records are re-put to the network.
    pub record_republish_interval: Duration,
    /// How often locally provided cids are re-advertised.
    pub provider_republish_interval: Duration,
    /// How often expired records and providers are swept.
    pub cleanup_interval: Duration,
    /// Remote acknowledgements required for a put to succeed.
    pub put_quorum: usize,
    /// Number of records gathered before a get runs the selector.
    pub get_record_count: usize,
    /// Maximum concurrent in-flight requests to a single peer.
    pub per_peer_inflight: usize,
    /// RPC failures tolerated before a contact is evicted.
    pub max_contact_failures: u32,
    /// Client mode: participate in lookups but do not serve inbound queries.
    pub client_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            beta: None,
            record_ttl: DEFAULT_RECORD_TTL,
            provider_ttl: DEFAULT_PROVIDER_TTL,
            query_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            bucket_refresh_interval: Duration::from_secs(10 * 60),
            record_republish_interval: Duration::from_secs(4 * 60 * 60),
            provider_republish_interval: Duration::from_secs(12 * 60 * 60),
            cleanup_interval: Duration::from_secs(10 * 60),
            put_quorum: 1,
            get_record_count: 16,
            per_peer_inflight: 4,
            max_contact_failures: 3,
            client_mode: false,
        }
    }
}

impl Config {
    /// Effective per-path concurrency.
    pub fn beta(&self) -> usize {
        self.beta.unwrap_or(self.alpha).max(1)
    }
}
