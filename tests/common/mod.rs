//! Shared in-process network harness for integration tests.
//!
//! Nodes register in a [`NetworkRegistry`]; requests route to the target
//! node's `handle_message` through the real codec, with injectable latency
//! and failures per peer.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use kadmesh::messages::{deserialize_message, serialize_message};
use kadmesh::record::LatestSelector;
use kadmesh::{
    Config, Contact, Dht, KadError, KadRpc, Message, PeerId, Result, Validator,
};

/// Honour `RUST_LOG` in test runs; safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Accepts any non-empty payload under the `/test/` namespace.
pub struct TestValidator;

impl Validator for TestValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if value.is_empty() {
            return Err(KadError::InvalidRecord {
                key: String::from_utf8_lossy(key).into_owned(),
                reason: "empty value".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<PeerId, Dht<TestNetwork>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: &Dht<TestNetwork>) {
        self.peers
            .write()
            .await
            .insert(node.local_peer().clone(), node.clone());
    }

    pub async fn get(&self, peer: &PeerId) -> Option<Dht<TestNetwork>> {
        self.peers.read().await.get(peer).cloned()
    }
}

#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_contact: Contact,
    failures: Arc<Mutex<HashSet<PeerId>>>,
    latencies: Arc<Mutex<HashMap<PeerId, Duration>>>,
    default_latency: Arc<Mutex<Option<Duration>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
        Self {
            registry,
            self_contact,
            failures: Arc::new(Mutex::new(HashSet::new())),
            latencies: Arc::new(Mutex::new(HashMap::new())),
            default_latency: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn set_failure(&self, peer: PeerId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(peer);
        } else {
            failures.remove(&peer);
        }
    }

    pub async fn set_latency(&self, peer: PeerId, latency: Duration) {
        self.latencies.lock().await.insert(peer, latency);
    }

    /// Latency applied to every request without a per-peer override.
    pub async fn set_default_latency(&self, latency: Duration) {
        *self.default_latency.lock().await = Some(latency);
    }

    async fn dispatch(&self, to: &Contact, msg: Message) -> Result<Message> {
        if self.failures.lock().await.contains(&to.peer) {
            return Err(KadError::Transport("injected network failure".into()));
        }
        let delay = match self.latencies.lock().await.get(&to.peer).copied() {
            Some(delay) => Some(delay),
            None => *self.default_latency.lock().await,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // Both directions go through the codec, as on a real stream.
        let msg = deserialize_message(&serialize_message(&msg)?)?;
        let Some(peer) = self.registry.get(&to.peer).await else {
            return Err(KadError::Transport("peer not reachable".into()));
        };
        let reply = peer.handle_message(&self.self_contact, msg).await?;
        Ok(deserialize_message(&serialize_message(&reply)?)?)
    }
}

#[async_trait]
impl KadRpc for TestNetwork {
    async fn request(&self, to: &Contact, msg: Message) -> Result<Message> {
        self.dispatch(to, msg).await
    }

    async fn notify(&self, to: &Contact, msg: Message) -> Result<()> {
        self.dispatch(to, msg).await.map(|_| ())
    }
}

pub struct TestNode {
    pub node: Dht<TestNetwork>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn spawn(registry: Arc<NetworkRegistry>, index: u32) -> Self {
        Self::spawn_with_config(registry, index, test_config()).await
    }

    pub async fn spawn_with_config(
        registry: Arc<NetworkRegistry>,
        index: u32,
        config: Config,
    ) -> Self {
        init_tracing();
        let contact = make_contact(index);
        let network = TestNetwork::new(registry.clone(), contact.clone());
        let node = Dht::builder(contact, network.clone())
            .config(config)
            .validator(b"test", Arc::new(TestValidator), Arc::new(LatestSelector))
            .spawn();
        registry.register(&node).await;
        Self { node, network }
    }

    pub fn contact(&self) -> Contact {
        self.node.local_contact()
    }

    pub fn peer(&self) -> PeerId {
        self.node.local_peer().clone()
    }
}

pub fn make_contact(index: u32) -> Contact {
    Contact::new(
        PeerId::from_bytes(format!("itest-peer-{index}").into_bytes()),
        vec![format!("/ip4/10.1.{}.{}/tcp/4001", index >> 8, index & 0xff)],
    )
}

pub fn test_config() -> Config {
    Config {
        query_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(1),
        ..Config::default()
    }
}

/// Wire `count` nodes so that node `i` knows nodes `i+step` for each step.
pub async fn spawn_mesh(
    registry: &Arc<NetworkRegistry>,
    count: u32,
    steps: &[u32],
) -> Vec<TestNode> {
    let mut nodes = Vec::with_capacity(count as usize);
    for i in 0..count {
        nodes.push(TestNode::spawn(registry.clone(), i).await);
    }
    for i in 0..count {
        for step in steps {
            let neighbour = nodes[((i + step) % count) as usize].contact();
            nodes[i as usize].node.observe(neighbour).await;
        }
    }
    // Let the observe commands drain into the routing tables.
    tokio::time::sleep(Duration::from_millis(50)).await;
    nodes
}
