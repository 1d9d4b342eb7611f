//! # Kadmesh - Kademlia DHT Core
//!
//! Kadmesh implements the core of a Kademlia distributed hash table for a
//! peer-to-peer overlay:
//!
//! - **Peer routing**: locate a peer's contact information by id
//! - **Values**: store and retrieve signed key/value records, best-effort
//!   replicated to the k closest peers
//! - **Providers**: announce and look up providers of a content id
//! - **Maintenance**: bucket refresh, record and provider republish, expiry
//!
//! The transport, peer store, and cryptographic identity live outside the
//! crate and plug in through the ports in [`protocols`].
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for safe concurrent state:
//! - [`dht::Dht`] is a cheap-to-clone public handle; a private actor owns
//!   the routing table and the record and provider stores
//! - Commands travel over async channels and are processed sequentially,
//!   so no store is ever mutated concurrently
//! - Iterative lookups run `α` disjoint paths with bounded per-path
//!   concurrency in [`query`]; paths never query the same peer twice
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `id` | Peer ids, the SHA-256 KadId space, XOR distance |
//! | `routing` | Splitting k-bucket tree with ping-before-evict |
//! | `record` | Records, validators/selectors, TTL-bounded local store |
//! | `provider` | Content-id provider store with expiry and GC |
//! | `messages` | Wire message types, bounded serialization |
//! | `protocols` | Ports: `KadRpc` transport, `AddressBook` peer store |
//! | `network` | Request pipeline: timeouts, in-flight caps, liveness |
//! | `query` | Disjoint-path iterative query engine |
//! | `dht` | Node actor, operations, handlers, maintenance loops |
//! | `config` | Tuning knobs and defaults |
//! | `error` | Error taxonomy |

pub mod config;
pub mod dht;
pub mod error;
pub mod id;
pub mod messages;
pub mod network;
pub mod protocols;
pub mod provider;
pub mod query;
pub mod record;
pub mod routing;

pub use config::Config;
pub use dht::{Dht, DhtBuilder, RetrievedRecord};
pub use error::{KadError, Result};
pub use id::{Contact, ConnectionType, Distance, KadId, PeerId};
pub use messages::{KadPeer, Message, MessageType, WireRecord};
pub use protocols::{AddressBook, KadRpc, MemoryAddressBook, PROTOCOL_NAME};
pub use query::{PathReport, PathStep, Query, QueryOutcome};
pub use record::{
    Datastore, MemoryDatastore, Record, RecordStore, Selector, Validator, ValidatorRegistry,
};
pub use routing::{RoutingEvent, RoutingTable};
