//! Identifiers and the XOR metric.
//!
//! Peers are known by an opaque [`PeerId`] (the multihash of their public
//! key). All distance arithmetic happens in a derived 256-bit space:
//! [`KadId`] is the SHA-256 digest of the peer-id bytes, or of arbitrary key
//! bytes for record and provider lookups. Every routing structure and query
//! in the crate agrees on this mapping.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque peer identifier: the multihash bytes of the peer's public key.
///
/// The crate never interprets these bytes beyond hashing them into the
/// [`KadId`] space and comparing them for equality.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// The point of this peer in XOR space.
    #[inline]
    pub fn kad_id(&self) -> KadId {
        KadId::from_bytes_digest(&self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = self.to_hex();
        write!(f, "PeerId({})", &hex[..hex.len().min(16)])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A point in the 256-bit XOR metric space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KadId([u8; 32]);

impl KadId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Map arbitrary key bytes into XOR space.
    #[inline]
    pub fn from_bytes_digest(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(digest.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &KadId) -> Distance {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for KadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KadId({})", &self.to_hex()[..16])
    }
}

/// An XOR distance, compared as a 256-bit unsigned big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Distance(pub [u8; 32]);

impl Distance {
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Number of leading zero bits; determines the bucket a contact falls in.
    #[inline]
    pub fn leading_zeros(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        256
    }
}

impl Ord for Distance {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Distance {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Debug for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Distance({})", &hex::encode(self.0)[..16])
    }
}

/// The bucket index for `other` relative to `self_id`: the depth of the
/// longest shared prefix, i.e. leading zeros of the XOR distance. 255 means
/// the ids are adjacent or equal.
pub fn bucket_index(self_id: &KadId, other: &KadId) -> usize {
    self_id.xor_distance(other).leading_zeros().min(255)
}

/// A random peer id whose *hash* lands in the bucket at `bucket_idx`
/// relative to `self_id`. Refresh lookups need a preimage because the wire
/// carries key bytes and every node hashes them independently; a raw point
/// in XOR space cannot be asked for.
///
/// Ids are found by rejection sampling, which costs about `2^(idx+1)` hashes
/// for bucket `idx`. Sampling is capped, so very deep buckets get the
/// nearest-depth id found instead of an exact hit; in a populated table the
/// stale buckets are the shallow ones, where a handful of attempts suffice.
pub fn random_peer_in_bucket(self_id: &KadId, bucket_idx: usize) -> PeerId {
    use rand::RngCore;

    const MAX_ATTEMPTS: usize = 1 << 16;

    let mut rng = rand::thread_rng();
    let mut best: Option<(usize, [u8; 16])> = None;
    for _ in 0..MAX_ATTEMPTS {
        let mut preimage = [0u8; 16];
        rng.fill_bytes(&mut preimage);
        let depth = bucket_index(self_id, &KadId::from_bytes_digest(&preimage));
        if depth == bucket_idx {
            return PeerId::from_bytes(preimage.to_vec());
        }
        let distance_off = depth.abs_diff(bucket_idx);
        if best.is_none_or(|(off, _)| distance_off < off) {
            best = Some((distance_off, preimage));
        }
    }
    let (_, preimage) = best.expect("at least one sample drawn");
    PeerId::from_bytes(preimage.to_vec())
}

/// How the sender believes it relates to a peer it is telling us about.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    #[default]
    NotConnected,
    Connected,
    CanConnect,
    CannotConnect,
}

/// Contact information for a peer: identity, known addresses, and the
/// connection state the information came with. Liveness bookkeeping lives in
/// the routing table, the authoritative address list in the address book.
///
/// The XOR-space position is hashed once at construction; everything that
/// sorts or buckets contacts reads the cached value.
#[derive(Clone, Debug)]
pub struct Contact {
    pub peer: PeerId,
    pub addrs: Vec<String>,
    pub connection: ConnectionType,
    kad_id: KadId,
}

impl Contact {
    pub fn new(peer: PeerId, addrs: Vec<String>) -> Self {
        let kad_id = peer.kad_id();
        Self {
            peer,
            addrs,
            connection: ConnectionType::NotConnected,
            kad_id,
        }
    }

    pub fn with_connection(mut self, connection: ConnectionType) -> Self {
        self.connection = connection;
        self
    }

    #[inline]
    pub fn kad_id(&self) -> KadId {
        self.kad_id
    }

    #[inline]
    pub fn distance_to(&self, target: &KadId) -> Distance {
        self.kad_id().xor_distance(target)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer
    }
}

impl Eq for Contact {}

/// Sort contacts in place by ascending XOR distance to `target`.
pub fn sort_by_distance(contacts: &mut [Contact], target: &KadId) {
    contacts.sort_by(|a, b| a.distance_to(target).cmp(&b.distance_to(target)));
}
