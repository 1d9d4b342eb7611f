//! The DHT node: actor, externally visible operations, inbound handlers,
//! and maintenance loops.
//!
//! [`Dht`] is a cheap-to-clone handle; [`DhtActor`] owns the routing table,
//! record store, and provider store, and processes commands sequentially so
//! no store is ever touched concurrently. Liveness observations from the
//! request pipeline flow into the same actor, which is the only writer of
//! routing state.
//!
//! | Operation | Built on |
//! |-----------|----------|
//! | `find_peer`, `get_closest_peers` | query engine + routing table |
//! | `provide`, `find_providers` | query engine + provider store |
//! | `put_value`, `get_value`, `get_many` | query engine + record store |
//! | `bootstrap` | self-lookup through a seed contact |
//!
//! Maintenance loops (bucket refresh, record republish, provider republish,
//! expiry sweep) bind to the instance lifetime and stop on [`Dht::shutdown`].

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{KadError, Result};
use crate::id::{Contact, KadId, PeerId, random_peer_in_bucket};
use crate::messages::{KadPeer, Message, MessageType};
use crate::network::{LivenessEvent, RpcClient};
use crate::protocols::{AddressBook, KadRpc, MemoryAddressBook};
use crate::provider::ProviderStore;
use crate::query::{PathStep, Query, QueryOutcome};
use crate::record::{
    Datastore, MemoryDatastore, Record, RecordStore, Selector, Validator, ValidatorRegistry,
    parse_public_key_key, peer_id_from_public_key, public_key_record_key,
};
use crate::routing::{PendingEviction, RoutingEvent, RoutingTable};

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// A record gathered during a lookup, with the peer that served it.
/// `from == None` marks the local copy.
#[derive(Clone, Debug)]
pub struct RetrievedRecord {
    pub record: Record,
    pub from: Option<Contact>,
}

enum Command {
    // State updates
    Observe(Contact),
    ApplyPingResult(PendingEviction, bool),

    // Queries against actor-owned state
    ClosestPeers(KadId, usize, oneshot::Sender<Vec<Contact>>),
    FindContact(PeerId, oneshot::Sender<Option<Contact>>),
    SubscribeRouting(oneshot::Sender<broadcast::Receiver<RoutingEvent>>),
    GetLocalRecord(Vec<u8>, oneshot::Sender<Option<Record>>),
    PutLocalRecord(Record, bool, oneshot::Sender<Result<()>>),
    LocalRecords(oneshot::Sender<Vec<Record>>),
    AddProvider(Vec<u8>, Contact),
    GetProviders(Vec<u8>, oneshot::Sender<Vec<Contact>>),
    ProvidedCids(PeerId, oneshot::Sender<Vec<Vec<u8>>>),

    // Maintenance
    StaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    Sweep,

    Quit,
}

/// Handle to a running DHT node.
pub struct Dht<N: KadRpc> {
    cmd_tx: mpsc::Sender<Command>,
    local: Contact,
    config: Arc<Config>,
    client: Arc<RpcClient<N>>,
    address_book: Arc<dyn AddressBook>,
    registry: Arc<ValidatorRegistry>,
    shutdown: CancellationToken,
}

impl<N: KadRpc> Clone for Dht<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local: self.local.clone(),
            config: self.config.clone(),
            client: self.client.clone(),
            address_book: self.address_book.clone(),
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Builder for a [`Dht`] instance. Everything has a default except the local
/// contact and the transport.
pub struct DhtBuilder<N: KadRpc> {
    local: Contact,
    network: N,
    config: Config,
    datastore: Box<dyn Datastore>,
    address_book: Arc<dyn AddressBook>,
    registry: ValidatorRegistry,
}

impl<N: KadRpc> DhtBuilder<N> {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn datastore(mut self, datastore: Box<dyn Datastore>) -> Self {
        self.datastore = datastore;
        self
    }

    pub fn address_book(mut self, address_book: Arc<dyn AddressBook>) -> Self {
        self.address_book = address_book;
        self
    }

    /// Register validation policy for a key namespace, e.g. `b"ipns"`.
    pub fn validator(
        mut self,
        namespace: &[u8],
        validator: Arc<dyn Validator>,
        selector: Arc<dyn Selector>,
    ) -> Self {
        self.registry.register(namespace, validator, selector);
        self
    }

    pub fn spawn(self) -> Dht<N> {
        let config = Arc::new(self.config);
        let registry = Arc::new(self.registry);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (client, liveness_rx) = RpcClient::new(
            Arc::new(self.network),
            config.request_timeout,
            config.per_peer_inflight,
        );
        let client = Arc::new(client);
        let shutdown = CancellationToken::new();

        let actor = DhtActor {
            routing: RoutingTable::new(
                self.local.kad_id(),
                config.k,
                config.max_contact_failures,
            ),
            records: RecordStore::new(self.datastore, registry.clone(), config.record_ttl),
            providers: ProviderStore::new(config.provider_ttl),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            liveness_rx,
            client: client.clone(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(actor.run());

        let dht = Dht {
            cmd_tx,
            local: self.local,
            config,
            client,
            address_book: self.address_book,
            registry,
            shutdown,
        };
        dht.spawn_maintenance();
        dht
    }
}

impl<N: KadRpc> Dht<N> {
    pub fn builder(local: Contact, network: N) -> DhtBuilder<N> {
        DhtBuilder {
            local,
            network,
            config: Config::default(),
            datastore: Box::new(MemoryDatastore::default()),
            address_book: Arc::new(MemoryAddressBook::default()),
            registry: ValidatorRegistry::default(),
        }
    }

    pub fn local_contact(&self) -> Contact {
        self.local.clone()
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local.peer
    }

    pub fn address_book(&self) -> &Arc<dyn AddressBook> {
        &self.address_book
    }

    /// Stream of routing-table membership changes.
    pub async fn routing_events(&self) -> Result<broadcast::Receiver<RoutingEvent>> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::SubscribeRouting(tx)).await?;
        rx.await.map_err(|_| KadError::Cancelled)
    }

    /// Feed a contact observed by the embedder (e.g. an inbound connection).
    pub async fn observe(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::Observe(contact)).await;
    }

    /// Join the network through a known peer: a self-lookup populates the
    /// closest buckets, then quiet buckets get refreshed on their own loop.
    pub async fn bootstrap(&self, seed: Contact) -> Result<Vec<Contact>> {
        self.observe(seed.clone()).await;
        self.address_book.add(&seed.peer, &seed.addrs);

        let mut seeds = self.closest_peers(self.local.kad_id(), self.config.k).await?;
        if !seeds.iter().any(|c| c.peer == seed.peer) {
            seeds.push(seed);
        }
        let self_key = self.local.peer.as_bytes().to_vec();
        let outcome = self.lookup(&self_key, seeds).await?;
        info!(
            discovered = outcome.closest.len(),
            "bootstrap lookup finished"
        );
        Ok(outcome.closest)
    }

    // ------------------------------------------------------------------
    // Peer routing
    // ------------------------------------------------------------------

    /// Locate a peer's contact information.
    pub async fn find_peer(&self, target: &PeerId) -> Result<Contact> {
        if target == &self.local.peer {
            return Ok(self.local.clone());
        }

        // Already known: routing table entry plus addresses in the book.
        if let Some(contact) = self.find_contact(target).await? {
            let addrs = self.address_book.addresses(target);
            if !addrs.is_empty() || !contact.addrs.is_empty() {
                trace!(peer = %target, "find_peer answered from routing table");
                return Ok(contact);
            }
        }

        let target_id = target.kad_id();
        let seeds = self.closest_peers(target_id, self.config.k).await?;
        if seeds.is_empty() {
            return Err(KadError::LookupFailed);
        }

        let dht = self.clone();
        let wanted = target.clone();
        let outcome = self
            .query(target_id)
            .run(seeds, &self.shutdown, move |_path, peer| {
                let dht = dht.clone();
                let wanted = wanted.clone();
                async move {
                    let reply = dht.client.request(&peer, Message::find_node(&wanted)).await?;
                    let closer = dht.absorb_closer_peers(&reply);
                    if let Some(hit) = closer.iter().find(|c| c.peer == wanted) {
                        return Ok(PathStep::Found { peer: hit.clone() });
                    }
                    Ok(PathStep::CloserPeers(closer))
                }
            })
            .await?;

        match outcome.found {
            Some(contact) => {
                self.address_book.add(&contact.peer, &contact.addrs);
                Ok(contact)
            }
            None => Err(KadError::NotFound),
        }
    }

    /// The `k` closest reachable peers to an arbitrary key.
    pub async fn get_closest_peers(&self, key: &[u8]) -> Result<Vec<Contact>> {
        let target = KadId::from_bytes_digest(key);
        let seeds = self.closest_peers(target, self.config.k).await?;
        let outcome = self.lookup(key, seeds).await?;
        Ok(outcome.closest)
    }

    /// FIND_NODE convergence toward `SHA-256(key)` with no winning
    /// condition. The wire carries the key bytes; every node hashes them
    /// into the same target point.
    async fn lookup(&self, key: &[u8], seeds: Vec<Contact>) -> Result<QueryOutcome> {
        let dht = self.clone();
        let key = key.to_vec();
        self.query(KadId::from_bytes_digest(&key))
            .run(seeds, &self.shutdown, move |_path, peer| {
                let dht = dht.clone();
                let key = key.clone();
                async move {
                    let msg = Message::new(MessageType::FindNode, key);
                    let reply = dht.client.request(&peer, msg).await?;
                    Ok(PathStep::CloserPeers(dht.absorb_closer_peers(&reply)))
                }
            })
            .await
    }

    // ------------------------------------------------------------------
    // Content routing
    // ------------------------------------------------------------------

    /// Advertise this node as a provider of `cid` to the `k` closest peers.
    /// Returns how many peers took the advertisement.
    pub async fn provide(&self, cid: &[u8]) -> Result<usize> {
        // Local registration first so lookups on this node see it at once.
        self.send_cmd(Command::AddProvider(cid.to_vec(), self.local.clone()))
            .await?;

        let closest = self.get_closest_peers(cid).await?;
        if closest.is_empty() {
            return Err(KadError::LookupFailed);
        }

        let msg = Message::add_provider(cid, &self.local);
        let mut tasks = JoinSet::new();
        for contact in closest {
            let client = self.client.clone();
            let msg = msg.clone();
            tasks.spawn(async move { client.notify(&contact, msg).await.is_ok() });
        }

        let mut notified = 0;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                notified += 1;
            }
        }
        debug!(cid = %hex_prefix(cid), notified, "provider advertised");
        Ok(notified)
    }

    /// Find up to `count` providers for `cid`. Local knowledge seeds the
    /// result; the query stops as soon as `count` distinct providers are
    /// known, the candidate space is exhausted, or the deadline fires.
    pub async fn find_providers(&self, cid: &[u8], count: usize) -> Result<Vec<Contact>> {
        let collected: Arc<Mutex<Vec<Contact>>> = Arc::new(Mutex::new(Vec::new()));

        let local = self.providers_of(cid).await?;
        {
            let mut found = collected.lock().expect("collector poisoned");
            for provider in local {
                if !found.iter().any(|c: &Contact| c.peer == provider.peer) {
                    found.push(provider);
                }
            }
            if found.len() >= count {
                found.truncate(count);
                return Ok(found.clone());
            }
        }

        let target = KadId::from_bytes_digest(cid);
        let seeds = self.closest_peers(target, self.config.k).await?;
        if seeds.is_empty() {
            // Nobody to ask; local knowledge is all there is.
            return Ok(collected.lock().expect("collector poisoned").clone());
        }

        let dht = self.clone();
        let cid_owned = cid.to_vec();
        let collector = collected.clone();
        let count_wanted = count;
        let outcome = self
            .query(target)
            .run(seeds, &self.shutdown, move |_path, peer| {
                let dht = dht.clone();
                let cid = cid_owned.clone();
                let collector = collector.clone();
                async move {
                    let reply = dht.client.request(&peer, Message::get_providers(&cid)).await?;
                    let closer = dht.absorb_closer_peers(&reply);

                    let mut done = false;
                    {
                        let mut found = collector.lock().expect("collector poisoned");
                        for provider in reply.provider_contacts() {
                            dht.address_book.add(&provider.peer, &provider.addrs);
                            if !found.iter().any(|c| c.peer == provider.peer) {
                                found.push(provider);
                            }
                        }
                        if found.len() >= count_wanted {
                            done = true;
                        }
                    }
                    if done {
                        Ok(PathStep::Found { peer })
                    } else {
                        Ok(PathStep::CloserPeers(closer))
                    }
                }
            })
            .await;

        // Exhaustion and timeout both leave whatever was gathered standing.
        if let Err(err) = outcome
            && !matches!(err, KadError::LookupFailed)
        {
            return Err(err);
        }

        let mut found = collected.lock().expect("collector poisoned").clone();
        found.truncate(count);
        Ok(found)
    }

    // ------------------------------------------------------------------
    // Value operations
    // ------------------------------------------------------------------

    /// Validate, store locally, and replicate a record to the `k` closest
    /// peers. Succeeds once the configured quorum of remotes acknowledged.
    pub async fn put_value(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let record = Record::new(key.to_vec(), value).with_author(self.local.peer.clone());
        self.put_local(record.clone(), true).await?;

        let closest = self.get_closest_peers(key).await?;
        if closest.is_empty() {
            return Err(KadError::LookupFailed);
        }

        let acks = self.replicate(&record, closest).await;
        let needed = self.config.put_quorum;
        if acks < needed {
            return Err(KadError::QuorumFailed { needed, got: acks });
        }
        Ok(())
    }

    /// Retrieve the best value for `key`. Collects records from the network,
    /// runs the selector, pushes the winner back to responders that served a
    /// stale copy, and refreshes a stale local copy.
    pub async fn get_value(&self, key: &[u8]) -> Result<Vec<u8>> {
        let gathered = self.gather_records(key, self.config.get_record_count).await?;
        if gathered.is_empty() {
            return Err(KadError::NotFound);
        }

        let records: Vec<Record> = gathered.iter().map(|r| r.record.clone()).collect();
        let best_idx = self.registry.select(key, &records)?;
        let best = records[best_idx].clone();

        // Correcting puts: any responder whose record differs from the
        // selected one gets the winner pushed back, best effort.
        let mut stale_local = false;
        for retrieved in &gathered {
            if retrieved.record.value == best.value {
                continue;
            }
            match &retrieved.from {
                Some(responder) => {
                    let client = self.client.clone();
                    let responder = responder.clone();
                    let msg = Message::put_value(&best);
                    tokio::spawn(async move {
                        if client.request(&responder, msg).await.is_err() {
                            trace!(peer = %responder.peer, "correcting put failed");
                        }
                    });
                }
                None => stale_local = true,
            }
        }
        if stale_local {
            let fresh = Record {
                time_received: chrono::Utc::now(),
                ..best.clone()
            };
            let _ = self.put_local(fresh, false).await;
        }

        Ok(best.value)
    }

    /// Up to `count` validated records for `key`, local copy included, no
    /// selection applied.
    pub async fn get_many(&self, key: &[u8], count: usize) -> Result<Vec<Record>> {
        let gathered = self.gather_records(key, count).await?;
        if gathered.is_empty() {
            return Err(KadError::NotFound);
        }
        Ok(gathered.into_iter().map(|r| r.record).take(count).collect())
    }

    /// Fetch and verify a peer's public key: address book first, then the
    /// `/pk/` record from the network. The hash check runs on every call,
    /// cached keys included.
    pub async fn get_public_key(&self, peer: &PeerId) -> Result<Vec<u8>> {
        if let Some(cached) = self.address_book.public_key(peer) {
            if peer_id_from_public_key(&cached) == *peer {
                return Ok(cached);
            }
            warn!(peer = %peer, "cached public key fails verification, refetching");
        }

        let key = public_key_record_key(peer);
        let value = self.get_value(&key).await?;
        if peer_id_from_public_key(&value) != *peer {
            return Err(KadError::InvalidPublicKey);
        }
        self.address_book.put_public_key(peer, value.clone());
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Inbound requests
    // ------------------------------------------------------------------

    /// Serve one inbound request. The transport layer authenticates `from`
    /// and feeds the decoded message here; the reply goes back on the same
    /// stream. In client mode nothing is served.
    pub async fn handle_message(&self, from: &Contact, msg: Message) -> Result<Message> {
        if self.config.client_mode {
            return Err(KadError::NotServing);
        }

        // An inbound request proves the sender is reachable right now.
        self.observe(from.clone()).await;
        if !from.addrs.is_empty() {
            self.address_book.add(&from.peer, &from.addrs);
        }

        match msg.msg_type {
            MessageType::FindNode => {
                let reply = Message::new(MessageType::FindNode, msg.key.clone())
                    .with_closer_peers(self.closer_peers_for(&msg.key, &from.peer).await?);
                Ok(reply)
            }
            MessageType::GetValue => {
                let mut reply = Message::new(MessageType::GetValue, msg.key.clone());
                if let Some(record) = self.local_record_or_public_key(&msg.key).await? {
                    reply.record = Some((&record).into());
                }
                reply.closer_peers = self.closer_peers_for(&msg.key, &from.peer).await?;
                Ok(reply)
            }
            MessageType::PutValue => {
                let Some(wire) = msg.record.clone() else {
                    return Err(KadError::invalid_record(&msg.key, "put without record"));
                };
                let mut record = wire.into_record();
                // Stamp the receive time; the sender's clock is not ours.
                record.time_received = chrono::Utc::now();
                if record.author.is_none() {
                    record.author = Some(from.peer.clone());
                }
                self.put_local(record, false).await?;
                Ok(msg)
            }
            MessageType::AddProvider => {
                // Only the transport-authenticated sender may register
                // itself; anything else in the list is silently dropped.
                for provider in msg.provider_contacts() {
                    if provider.peer != from.peer {
                        trace!(
                            claimed = %provider.peer,
                            sender = %from.peer,
                            "dropping provider registration for foreign peer"
                        );
                        continue;
                    }
                    self.address_book.add(&provider.peer, &provider.addrs);
                    self.send_cmd(Command::AddProvider(msg.key.clone(), provider))
                        .await?;
                }
                Ok(Message::new(MessageType::AddProvider, msg.key))
            }
            MessageType::GetProviders => {
                let providers = self.providers_of(&msg.key).await?;
                let mut reply = Message::new(MessageType::GetProviders, msg.key.clone());
                reply.provider_peers = providers.iter().map(KadPeer::from).collect();
                reply.closer_peers = self.closer_peers_for(&msg.key, &from.peer).await?;
                Ok(reply)
            }
            MessageType::Ping => Ok(Message::ping()),
        }
    }

    /// Stop maintenance loops and the actor. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn query(&self, target: KadId) -> Query {
        Query {
            target,
            paths: self.config.alpha,
            parallelism: self.config.beta(),
            width: self.config.k,
            timeout: self.config.query_timeout,
            local_peer: Some(self.local.peer.clone()),
        }
    }

    /// Record gossiped addresses and return the reply's closer peers with
    /// self filtered out and the list clipped to `k`.
    fn absorb_closer_peers(&self, reply: &Message) -> Vec<Contact> {
        let mut closer = reply.closer_contacts();
        closer.retain(|c| c.peer != self.local.peer);
        closer.truncate(self.config.k);
        for contact in &closer {
            if !contact.addrs.is_empty() {
                self.address_book.add(&contact.peer, &contact.addrs);
            }
        }
        closer
    }

    /// Closer peers for a reply: the `k` closest known to the key's point,
    /// excluding ourselves and the requester, addresses topped up from the
    /// address book.
    async fn closer_peers_for(&self, key: &[u8], requester: &PeerId) -> Result<Vec<KadPeer>> {
        let target = KadId::from_bytes_digest(key);
        let mut closest = self.closest_peers(target, self.config.k).await?;
        closest.retain(|c| &c.peer != requester && c.peer != self.local.peer);
        Ok(closest
            .iter()
            .map(|contact| {
                let mut peer = KadPeer::from(contact);
                if peer.addrs.is_empty() {
                    peer.addrs = self.address_book.addresses(&peer.id);
                }
                peer
            })
            .collect())
    }

    /// The local record for `key`, or the `/pk/` fast path: our own or a
    /// cached public key is served straight from the address book.
    async fn local_record_or_public_key(&self, key: &[u8]) -> Result<Option<Record>> {
        if let Some(record) = self.local_record(key).await? {
            return Ok(Some(record));
        }
        if let Some(peer) = parse_public_key_key(key)
            && let Some(public_key) = self.address_book.public_key(&peer)
            && peer_id_from_public_key(&public_key) == peer
        {
            return Ok(Some(Record::new(key.to_vec(), public_key)));
        }
        Ok(None)
    }

    /// Collect up to `count` validated records for `key` from the local
    /// store and the network.
    async fn gather_records(&self, key: &[u8], count: usize) -> Result<Vec<RetrievedRecord>> {
        let collected: Arc<Mutex<Vec<RetrievedRecord>>> = Arc::new(Mutex::new(Vec::new()));

        let local = self.local_record(key).await?;
        let is_pk = parse_public_key_key(key).is_some();
        if let Some(record) = local {
            // Public keys are immutable: a valid local copy is the answer.
            if is_pk {
                return Ok(vec![RetrievedRecord { record, from: None }]);
            }
            collected
                .lock()
                .expect("collector poisoned")
                .push(RetrievedRecord { record, from: None });
        }

        let target = KadId::from_bytes_digest(key);
        let seeds = self.closest_peers(target, self.config.k).await?;
        if seeds.is_empty() {
            let local_only = collected.lock().expect("collector poisoned").clone();
            if local_only.is_empty() {
                return Err(KadError::LookupFailed);
            }
            return Ok(local_only);
        }

        let dht = self.clone();
        let key_owned = key.to_vec();
        let collector = collected.clone();
        let outcome = self
            .query(target)
            .run(seeds, &self.shutdown, move |_path, peer| {
                let dht = dht.clone();
                let key = key_owned.clone();
                let collector = collector.clone();
                async move {
                    let reply = dht.client.request(&peer, Message::get_value(&key)).await?;
                    let closer = dht.absorb_closer_peers(&reply);

                    let mut done = false;
                    if let Some(wire) = reply.record.clone() {
                        let record = wire.into_record();
                        if record.key == key && dht.registry.validate(&key, &record.value).is_ok() {
                            let mut found = collector.lock().expect("collector poisoned");
                            found.push(RetrievedRecord {
                                record,
                                from: Some(peer.clone()),
                            });
                            done = found.len() >= count;
                        } else {
                            trace!(peer = %peer.peer, "discarding invalid record from responder");
                        }
                    }
                    if done {
                        Ok(PathStep::Found { peer })
                    } else {
                        Ok(PathStep::CloserPeers(closer))
                    }
                }
            })
            .await;

        if let Err(err) = outcome
            && !matches!(err, KadError::LookupFailed)
        {
            return Err(err);
        }

        let gathered = collected.lock().expect("collector poisoned").clone();
        Ok(gathered)
    }

    /// PUT_VALUE to each target in parallel; counts acknowledgements.
    async fn replicate(&self, record: &Record, targets: Vec<Contact>) -> usize {
        let msg = Message::put_value(record);
        let mut tasks = JoinSet::new();
        for contact in targets.into_iter().take(self.config.k) {
            let client = self.client.clone();
            let msg = msg.clone();
            tasks.spawn(async move {
                match client.request(&contact, msg).await {
                    Ok(reply) => reply.msg_type == MessageType::PutValue,
                    Err(_) => false,
                }
            });
        }

        let mut acks = 0;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                acks += 1;
            }
        }
        acks
    }

    async fn send_cmd(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| KadError::Cancelled)
    }

    async fn closest_peers(&self, target: KadId, count: usize) -> Result<Vec<Contact>> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::ClosestPeers(target, count, tx)).await?;
        rx.await.map_err(|_| KadError::Cancelled)
    }

    async fn find_contact(&self, peer: &PeerId) -> Result<Option<Contact>> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::FindContact(peer.clone(), tx)).await?;
        rx.await.map_err(|_| KadError::Cancelled)
    }

    async fn local_record(&self, key: &[u8]) -> Result<Option<Record>> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::GetLocalRecord(key.to_vec(), tx)).await?;
        rx.await.map_err(|_| KadError::Cancelled)
    }

    async fn put_local(&self, record: Record, local: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::PutLocalRecord(record, local, tx)).await?;
        rx.await.map_err(|_| KadError::Cancelled)?
    }

    async fn providers_of(&self, cid: &[u8]) -> Result<Vec<Contact>> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::GetProviders(cid.to_vec(), tx)).await?;
        rx.await.map_err(|_| KadError::Cancelled)
    }

    // ------------------------------------------------------------------
    // Maintenance loops
    // ------------------------------------------------------------------

    fn spawn_maintenance(&self) {
        self.spawn_bucket_refresh();
        self.spawn_record_republish();
        self.spawn_provider_republish();
        self.spawn_cleanup();
    }

    fn spawn_bucket_refresh(&self) {
        let dht = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dht.config.bucket_refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = dht.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let (tx, rx) = oneshot::channel();
                if dht
                    .send_cmd(Command::StaleBuckets(dht.config.bucket_refresh_interval, tx))
                    .await
                    .is_err()
                {
                    break;
                }
                let stale = match rx.await {
                    Ok(stale) => stale,
                    Err(_) => break,
                };
                if stale.is_empty() {
                    continue;
                }

                debug!(count = stale.len(), "refreshing quiet buckets");
                let self_id = dht.local.kad_id();
                for bucket_idx in stale {
                    let probe = random_peer_in_bucket(&self_id, bucket_idx);
                    let seeds = match dht.closest_peers(probe.kad_id(), dht.config.k).await {
                        Ok(seeds) => seeds,
                        Err(_) => return,
                    };
                    if let Err(err) = dht.lookup(probe.as_bytes(), seeds).await {
                        trace!(bucket = bucket_idx, error = %err, "bucket refresh lookup failed");
                    }
                    let _ = dht.send_cmd(Command::MarkBucketRefreshed(bucket_idx)).await;
                }
            }
        });
    }

    fn spawn_record_republish(&self) {
        let dht = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dht.config.record_republish_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = dht.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let (tx, rx) = oneshot::channel();
                if dht.send_cmd(Command::LocalRecords(tx)).await.is_err() {
                    break;
                }
                let records = rx.await.unwrap_or_default();
                for mut record in records {
                    record.time_received = chrono::Utc::now();
                    let key = record.key.clone();
                    if dht.put_local(record.clone(), true).await.is_err() {
                        continue;
                    }
                    match dht.get_closest_peers(&key).await {
                        Ok(closest) if !closest.is_empty() => {
                            let acks = dht.replicate(&record, closest).await;
                            trace!(key = %hex_prefix(&key), acks, "record republished");
                        }
                        _ => trace!(key = %hex_prefix(&key), "record republish found no peers"),
                    }
                }
            }
        });
    }

    fn spawn_provider_republish(&self) {
        let dht = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dht.config.provider_republish_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = dht.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let (tx, rx) = oneshot::channel();
                if dht
                    .send_cmd(Command::ProvidedCids(dht.local.peer.clone(), tx))
                    .await
                    .is_err()
                {
                    break;
                }
                let cids = rx.await.unwrap_or_default();
                for cid in cids {
                    if let Err(err) = dht.provide(&cid).await {
                        trace!(cid = %hex_prefix(&cid), error = %err, "provider republish failed");
                    }
                }
            }
        });
    }

    fn spawn_cleanup(&self) {
        let dht = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dht.config.cleanup_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = dht.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if dht.send_cmd(Command::Sweep).await.is_err() {
                    break;
                }
            }
        });
    }
}

// ----------------------------------------------------------------------
// Actor
// ----------------------------------------------------------------------

struct DhtActor<N: KadRpc> {
    routing: RoutingTable,
    records: RecordStore,
    providers: ProviderStore,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    liveness_rx: mpsc::UnboundedReceiver<LivenessEvent>,
    client: Arc<RpcClient<N>>,
    shutdown: CancellationToken,
}

impl<N: KadRpc> DhtActor<N> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                event = self.liveness_rx.recv() => {
                    match event {
                        Some(LivenessEvent::Alive(contact)) => self.observe_contact(contact),
                        Some(LivenessEvent::Failed(peer)) => self.routing.record_failure(&peer),
                        None => {}
                    }
                }
            }
        }
        debug!("dht actor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Observe(contact) => self.observe_contact(contact),
            Command::ApplyPingResult(pending, alive) => {
                self.routing.apply_ping_result(pending, alive);
            }
            Command::ClosestPeers(target, count, reply) => {
                let _ = reply.send(self.routing.closest(&target, count));
            }
            Command::FindContact(peer, reply) => {
                let _ = reply.send(self.routing.find(&peer));
            }
            Command::SubscribeRouting(reply) => {
                let _ = reply.send(self.routing.subscribe());
            }
            Command::GetLocalRecord(key, reply) => {
                let record = self.records.get(&key).unwrap_or_default();
                let _ = reply.send(record);
            }
            Command::PutLocalRecord(record, local, reply) => {
                let _ = reply.send(self.records.put(record, local));
            }
            Command::LocalRecords(reply) => {
                let _ = reply.send(self.records.local_records());
            }
            Command::AddProvider(cid, provider) => {
                self.providers.add(&cid, provider);
            }
            Command::GetProviders(cid, reply) => {
                let _ = reply.send(self.providers.providers(&cid));
            }
            Command::ProvidedCids(peer, reply) => {
                let _ = reply.send(self.providers.provided_by(&peer));
            }
            Command::StaleBuckets(threshold, reply) => {
                let _ = reply.send(self.routing.stale_buckets(threshold));
            }
            Command::MarkBucketRefreshed(idx) => {
                self.routing.mark_bucket_refreshed(idx);
            }
            Command::Sweep => {
                self.records.expire_sweep();
                self.providers.gc();
            }
            Command::Quit => unreachable!("Quit breaks the loop before dispatch"),
        }
    }

    /// Insert a contact; a full bucket defers to a liveness ping on the
    /// incumbent, resolved off the actor task.
    fn observe_contact(&mut self, contact: Contact) {
        let Some(pending) = self.routing.insert(contact) else {
            return;
        };
        let client = self.client.clone();
        let cmd_tx = self.cmd_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let alive = tokio::select! {
                res = client.request(&pending.oldest, Message::ping()) => res.is_ok(),
                _ = shutdown.cancelled() => return,
            };
            let _ = cmd_tx.send(Command::ApplyPingResult(pending, alive)).await;
        });
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(8)])
}
