//! Wire protocol messages.
//!
//! One request and one response of this shape travel per stream; the framed
//! transport itself is supplied by the embedder. Messages are serialized with
//! bincode under a hard size limit so a malicious frame cannot balloon into
//! unbounded allocations during decode.
//!
//! | Type | Request carries | Response carries |
//! |------|-----------------|------------------|
//! | `FindNode` | key = target peer id | `closer_peers` |
//! | `GetValue` | key | `record` and/or `closer_peers` |
//! | `PutValue` | key + `record` | echoed `record` |
//! | `AddProvider` | key = cid, `provider_peers` = self | (one-way) |
//! | `GetProviders` | key = cid | `provider_peers` + `closer_peers` |
//! | `Ping` | — | — |

use bincode::Options;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::id::{Contact, ConnectionType, PeerId};
use crate::record::Record;

/// Maximum size of a stored value (1 MiB). Larger payloads belong in an
/// external blob store with only the reference in the DHT.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization, slightly above [`MAX_VALUE_SIZE`]
/// to leave room for peer lists and framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 64 * 1024;

/// Legacy cluster-level ceiling; raw values outside `[0, 10]` are clamped.
pub const MAX_CLUSTER_LEVEL: u32 = 10;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced. Always use this instead of raw
/// `bincode::deserialize` for bytes that crossed the network.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(msg)
}

pub fn deserialize_message(bytes: &[u8]) -> Result<Message, bincode::Error> {
    deserialize_bounded(bytes)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    PutValue,
    GetValue,
    AddProvider,
    GetProviders,
    FindNode,
    Ping,
}

/// Peer info as it appears on the wire: raw id bytes, addresses, and the
/// sender's view of its connectivity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KadPeer {
    pub id: PeerId,
    pub addrs: Vec<String>,
    pub connection: ConnectionType,
}

impl From<&Contact> for KadPeer {
    fn from(contact: &Contact) -> Self {
        Self {
            id: contact.peer.clone(),
            addrs: contact.addrs.clone(),
            connection: contact.connection,
        }
    }
}

impl From<KadPeer> for Contact {
    fn from(peer: KadPeer) -> Self {
        let connection = peer.connection;
        Contact::new(peer.id, peer.addrs).with_connection(connection)
    }
}

/// A record in wire form. Identical to [`Record`] except that the receive
/// time travels as an RFC3339 string for cross-implementation compatibility.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub author: Option<PeerId>,
    pub signature: Option<Vec<u8>>,
    pub time_received: String,
}

impl From<&Record> for WireRecord {
    fn from(record: &Record) -> Self {
        Self {
            key: record.key.clone(),
            value: record.value.clone(),
            author: record.author.clone(),
            signature: record.signature.clone(),
            time_received: record
                .time_received
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
        }
    }
}

impl WireRecord {
    /// Convert back to a domain record. A missing or malformed timestamp
    /// falls back to the local receive time, as a fresh record would get.
    pub fn into_record(self) -> Record {
        let time_received = DateTime::parse_from_rfc3339(&self.time_received)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Record {
            key: self.key,
            value: self.value,
            author: self.author,
            signature: self.signature,
            time_received,
        }
    }
}

/// A single request or response on a Kad stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    /// Legacy field, kept on the wire for compatibility. Offset by one so
    /// that zero remains "unset"; read through [`Message::cluster_level`].
    pub cluster_level_raw: u32,
    pub key: Vec<u8>,
    pub record: Option<WireRecord>,
    pub closer_peers: Vec<KadPeer>,
    pub provider_peers: Vec<KadPeer>,
}

impl Message {
    pub fn new(msg_type: MessageType, key: Vec<u8>) -> Self {
        Self {
            msg_type,
            cluster_level_raw: 0,
            key,
            record: None,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
        }
    }

    pub fn find_node(target: &PeerId) -> Self {
        Self::new(MessageType::FindNode, target.as_bytes().to_vec())
    }

    pub fn get_value(key: &[u8]) -> Self {
        Self::new(MessageType::GetValue, key.to_vec())
    }

    pub fn put_value(record: &Record) -> Self {
        let mut msg = Self::new(MessageType::PutValue, record.key.clone());
        msg.record = Some(WireRecord::from(record));
        msg
    }

    pub fn add_provider(cid: &[u8], provider: &Contact) -> Self {
        let mut msg = Self::new(MessageType::AddProvider, cid.to_vec());
        msg.provider_peers = vec![KadPeer::from(provider)];
        msg
    }

    pub fn get_providers(cid: &[u8]) -> Self {
        Self::new(MessageType::GetProviders, cid.to_vec())
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, Vec::new())
    }

    /// The clamped legacy cluster level.
    pub fn cluster_level(&self) -> u32 {
        self.cluster_level_raw.saturating_sub(1).min(MAX_CLUSTER_LEVEL)
    }

    pub fn set_cluster_level(&mut self, level: u32) {
        self.cluster_level_raw = level.min(MAX_CLUSTER_LEVEL) + 1;
    }

    pub fn with_closer_peers(mut self, peers: Vec<KadPeer>) -> Self {
        self.closer_peers = peers;
        self
    }

    /// Closer peers as domain contacts; self and sender filtering is the
    /// caller's job.
    pub fn closer_contacts(&self) -> Vec<Contact> {
        self.closer_peers.iter().cloned().map(Contact::from).collect()
    }

    pub fn provider_contacts(&self) -> Vec<Contact> {
        self.provider_peers.iter().cloned().map(Contact::from).collect()
    }
}
