//! Port traits that connect the DHT core to its external collaborators.
//!
//! The transport, peer store, and identity machinery live outside this crate;
//! the core talks to them through the traits here. Traits are defined apart
//! from any implementation so the query engine and node depend only on the
//! contract, and tests can plug in an in-process network.

use async_trait::async_trait;

use crate::error::Result;
use crate::id::{Contact, PeerId};
use crate::messages::Message;

/// Stream protocol id the embedder registers its handler under. One framed
/// request and one framed response travel per stream.
pub const PROTOCOL_NAME: &str = "/ipfs/kad/1.0.0";

/// One request/response exchange with a remote peer over a framed stream.
///
/// Implementations open the stream, write the framed request, read exactly
/// one framed response, and close the stream. They do not retry and do not
/// apply timeouts; [`crate::network::RpcClient`] owns deadlines, per-peer
/// concurrency caps, and liveness accounting.
#[async_trait]
pub trait KadRpc: Send + Sync + 'static {
    /// Send a request and await the single reply.
    async fn request(&self, to: &Contact, msg: Message) -> Result<Message>;

    /// Fire-and-forget notification; the stream is closed after the write.
    async fn notify(&self, to: &Contact, msg: Message) -> Result<()>;
}

/// Minimal address-book port: the external peer store maps peer ids to known
/// network addresses and, when it has seen one, the peer's public key. The
/// core never assumes public keys are cached; `public_key` returning `None`
/// sends the caller to the network.
pub trait AddressBook: Send + Sync {
    fn add(&self, peer: &PeerId, addrs: &[String]);
    fn addresses(&self, peer: &PeerId) -> Vec<String>;
    fn public_key(&self, peer: &PeerId) -> Option<Vec<u8>>;
    fn put_public_key(&self, peer: &PeerId, public_key: Vec<u8>);
}

/// In-memory address book for tests and single-process embedders.
#[derive(Default)]
pub struct MemoryAddressBook {
    inner: std::sync::Mutex<MemoryAddressBookInner>,
}

#[derive(Default)]
struct MemoryAddressBookInner {
    addrs: std::collections::HashMap<PeerId, Vec<String>>,
    public_keys: std::collections::HashMap<PeerId, Vec<u8>>,
}

impl AddressBook for MemoryAddressBook {
    fn add(&self, peer: &PeerId, addrs: &[String]) {
        let mut inner = self.inner.lock().expect("address book poisoned");
        let known = inner.addrs.entry(peer.clone()).or_default();
        for addr in addrs {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
    }

    fn addresses(&self, peer: &PeerId) -> Vec<String> {
        let inner = self.inner.lock().expect("address book poisoned");
        inner.addrs.get(peer).cloned().unwrap_or_default()
    }

    fn public_key(&self, peer: &PeerId) -> Option<Vec<u8>> {
        let inner = self.inner.lock().expect("address book poisoned");
        inner.public_keys.get(peer).cloned()
    }

    fn put_public_key(&self, peer: &PeerId, public_key: Vec<u8>) {
        let mut inner = self.inner.lock().expect("address book poisoned");
        inner.public_keys.insert(peer.clone(), public_key);
    }
}
