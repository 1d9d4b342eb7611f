//! XOR-metric routing table.
//!
//! A k-bucket tree keyed by our own id. Bucket `i` holds contacts whose XOR
//! distance to self has exactly `i` leading zero bits; the tail bucket covers
//! everything deeper and splits on overflow, so the region around our own id
//! stays the most finely divided. Other buckets evict by least-recently-seen,
//! but only after the caller has pinged the incumbent: [`RoutingTable::insert`]
//! hands back a [`PendingEviction`] and the liveness check happens outside,
//! [`RoutingTable::apply_ping_result`] commits the outcome.
//!
//! Every contact stored was reachable at insertion time. Repeated RPC
//! failures (reported through [`RoutingTable::record_failure`]) evict a
//! contact once they cross the configured threshold.

use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::id::{Contact, Distance, KadId, PeerId, bucket_index};

/// Capacity of the routing event channel; slow subscribers lose old events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Deepest bucket depth; ids sharing all 255 prefix bits land together.
const MAX_BUCKET_DEPTH: usize = 255;

#[derive(Clone, Debug)]
pub enum RoutingEvent {
    Added(Contact),
    Removed(PeerId),
}

#[derive(Clone, Debug)]
struct BucketEntry {
    contact: Contact,
    last_seen: Instant,
    failures: u32,
}

/// One bucket, ordered least-recently-seen first.
struct KBucket {
    entries: Vec<BucketEntry>,
    last_activity: Instant,
}

enum TouchOutcome {
    Inserted,
    Refreshed,
    Full { oldest: Box<Contact> },
}

/// A full bucket wants to evict its least-recently-seen contact in favour of
/// a newcomer, pending a liveness check on the incumbent.
#[derive(Clone, Debug)]
pub struct PendingEviction {
    pub oldest: Contact,
    pub newcomer: Contact,
}

impl KBucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    fn mark_active(&mut self) {
        self.last_activity = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_activity.elapsed() > threshold
    }

    fn touch(&mut self, contact: Contact, k: usize) -> TouchOutcome {
        if let Some(pos) = self.entries.iter().position(|e| e.contact.peer == contact.peer) {
            let mut entry = self.entries.remove(pos);
            entry.contact = contact;
            entry.last_seen = Instant::now();
            entry.failures = 0;
            self.entries.push(entry);
            self.mark_active();
            return TouchOutcome::Refreshed;
        }

        if self.entries.len() < k {
            self.entries.push(BucketEntry {
                contact,
                last_seen: Instant::now(),
                failures: 0,
            });
            self.mark_active();
            TouchOutcome::Inserted
        } else {
            debug_assert!(!self.entries.is_empty(), "bucket len >= k but entries empty");
            let oldest = self
                .entries
                .first()
                .map(|e| e.contact.clone())
                .unwrap_or_else(|| contact.clone());
            TouchOutcome::Full {
                oldest: Box::new(oldest),
            }
        }
    }

    fn refresh(&mut self, peer: &PeerId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| &e.contact.peer == peer) {
            let mut entry = self.entries.remove(pos);
            entry.last_seen = Instant::now();
            self.entries.push(entry);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, peer: &PeerId) -> Option<Contact> {
        let pos = self.entries.iter().position(|e| &e.contact.peer == peer)?;
        Some(self.entries.remove(pos).contact)
    }
}

pub struct RoutingTable {
    self_id: KadId,
    k: usize,
    max_failures: u32,
    /// `buckets[i]` covers depth `i`; the last covers everything deeper.
    buckets: Vec<KBucket>,
    events: broadcast::Sender<RoutingEvent>,
}

impl RoutingTable {
    pub fn new(self_id: KadId, k: usize, max_failures: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            self_id,
            k,
            max_failures,
            buckets: vec![KBucket::new()],
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoutingEvent> {
        self.events.subscribe()
    }

    pub fn self_id(&self) -> KadId {
        self.self_id
    }

    fn bucket_pos(&self, id: &KadId) -> usize {
        bucket_index(&self.self_id, id).min(self.buckets.len() - 1)
    }

    fn is_tail(&self, pos: usize) -> bool {
        pos == self.buckets.len() - 1
    }

    /// Insert or refresh a contact. Never fails from the caller's viewpoint:
    /// a full bucket either splits (when it covers our own prefix) or yields
    /// a [`PendingEviction`] for the caller to resolve with a ping.
    pub fn insert(&mut self, contact: Contact) -> Option<PendingEviction> {
        if contact.kad_id() == self.self_id {
            return None;
        }

        let mut contact = contact;
        loop {
            let pos = self.bucket_pos(&contact.kad_id());
            match self.buckets[pos].touch(contact.clone(), self.k) {
                TouchOutcome::Inserted => {
                    trace!(peer = %contact.peer, bucket = pos, "contact added");
                    let _ = self.events.send(RoutingEvent::Added(contact));
                    return None;
                }
                TouchOutcome::Refreshed => return None,
                TouchOutcome::Full { oldest } => {
                    if self.is_tail(pos) && self.buckets.len() - 1 < MAX_BUCKET_DEPTH {
                        self.split_tail();
                        continue;
                    }
                    return Some(PendingEviction {
                        oldest: *oldest,
                        newcomer: contact,
                    });
                }
            }
        }
    }

    /// Split the tail bucket: entries at the tail's own depth stay, deeper
    /// ones move into a new tail.
    fn split_tail(&mut self) {
        let boundary = self.buckets.len() - 1;
        let entries = std::mem::take(&mut self.buckets[boundary].entries);
        self.buckets.push(KBucket::new());

        for entry in entries {
            let depth = bucket_index(&self.self_id, &entry.contact.kad_id());
            let pos = depth.min(self.buckets.len() - 1);
            self.buckets[pos].entries.push(entry);
        }
        debug!(depth = boundary, buckets = self.buckets.len(), "bucket split");
    }

    /// Commit the outcome of the liveness ping behind a [`PendingEviction`].
    pub fn apply_ping_result(&mut self, pending: PendingEviction, oldest_alive: bool) {
        let pos = self.bucket_pos(&pending.oldest.kad_id());
        if oldest_alive {
            self.buckets[pos].refresh(&pending.oldest.peer);
            return;
        }

        if self.buckets[pos].remove(&pending.oldest.peer).is_some() {
            let _ = self.events.send(RoutingEvent::Removed(pending.oldest.peer.clone()));
        }
        // The newcomer may have been inserted by other traffic meanwhile.
        let pos = self.bucket_pos(&pending.newcomer.kad_id());
        let bucket = &mut self.buckets[pos];
        let already_present = bucket
            .entries
            .iter()
            .any(|e| e.contact.peer == pending.newcomer.peer);
        if !already_present && bucket.entries.len() < self.k {
            let newcomer = pending.newcomer.clone();
            bucket.entries.push(BucketEntry {
                contact: pending.newcomer,
                last_seen: Instant::now(),
                failures: 0,
            });
            let _ = self.events.send(RoutingEvent::Added(newcomer));
        }
    }

    /// Bump the failure counter for a peer; evict past the threshold.
    pub fn record_failure(&mut self, peer: &PeerId) {
        let pos = self.bucket_pos(&peer.kad_id());
        let bucket = &mut self.buckets[pos];
        let Some(entry) = bucket.entries.iter_mut().find(|e| &e.contact.peer == peer) else {
            return;
        };
        entry.failures += 1;
        if entry.failures >= self.max_failures {
            debug!(peer = %peer, failures = entry.failures, "evicting unresponsive contact");
            bucket.remove(peer);
            let _ = self.events.send(RoutingEvent::Removed(peer.clone()));
        }
    }

    pub fn remove(&mut self, peer: &PeerId) {
        let pos = self.bucket_pos(&peer.kad_id());
        if self.buckets[pos].remove(peer).is_some() {
            let _ = self.events.send(RoutingEvent::Removed(peer.clone()));
        }
    }

    pub fn find(&self, peer: &PeerId) -> Option<Contact> {
        let pos = self.bucket_pos(&peer.kad_id());
        self.buckets[pos]
            .entries
            .iter()
            .find(|e| &e.contact.peer == peer)
            .map(|e| e.contact.clone())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    /// Up to `count` known contacts, strictly ascending in XOR distance to
    /// `target`.
    pub fn closest(&self, target: &KadId, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        struct DistContact {
            dist: Distance,
            contact: Contact,
        }

        impl PartialEq for DistContact {
            fn eq(&self, other: &Self) -> bool {
                self.dist == other.dist
            }
        }
        impl Eq for DistContact {}
        impl Ord for DistContact {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.dist.cmp(&other.dist)
            }
        }
        impl PartialOrd for DistContact {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        // Max-heap of the best `count` seen so far; the root is the worst
        // of the keepers and falls out when something closer shows up.
        let mut heap: std::collections::BinaryHeap<DistContact> =
            std::collections::BinaryHeap::with_capacity(count + 1);

        for bucket in &self.buckets {
            for entry in &bucket.entries {
                let dist = entry.contact.distance_to(target);
                if heap.len() < count {
                    heap.push(DistContact {
                        dist,
                        contact: entry.contact.clone(),
                    });
                } else if let Some(worst) = heap.peek()
                    && dist < worst.dist
                {
                    heap.push(DistContact {
                        dist,
                        contact: entry.contact.clone(),
                    });
                    heap.pop();
                }
            }
        }

        let mut result: Vec<DistContact> = heap.into_vec();
        result.sort_by(|a, b| a.dist.cmp(&b.dist));
        result.into_iter().map(|dc| dc.contact).collect()
    }

    /// Indices of non-empty buckets with no activity since `threshold` ago.
    pub fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty() && b.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, idx: usize) {
        if idx < self.buckets.len() {
            self.buckets[idx].mark_active();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{PeerId, sort_by_distance};

    fn contact(index: u32) -> Contact {
        Contact::new(
            PeerId::from_bytes(format!("peer-{index}").into_bytes()),
            vec![format!("/ip4/10.0.0.{}/tcp/4001", index % 250 + 1)],
        )
    }

    fn self_id() -> KadId {
        KadId::from_bytes_digest(b"self-node")
    }

    /// Indices whose contacts share at least the first bit with `self_id`.
    fn indices_sharing_self_prefix(n: usize) -> Vec<u32> {
        let me = self_id();
        (0u32..)
            .filter(|i| bucket_index(&me, &contact(*i).kad_id()) >= 1)
            .take(n)
            .collect()
    }

    #[test]
    fn closest_is_sorted_strictly_by_distance() {
        let mut table = RoutingTable::new(self_id(), 20, 3);
        for i in 0..50 {
            table.insert(contact(i));
        }

        let target = KadId::from_bytes_digest(b"target");
        let closest = table.closest(&target, 20);
        assert!(!closest.is_empty());
        for pair in closest.windows(2) {
            assert!(pair[0].distance_to(&target) < pair[1].distance_to(&target));
        }
    }

    #[test]
    fn bucket_covering_self_splits_on_overflow() {
        let k = 20;
        let mut table = RoutingTable::new(self_id(), k, 3);

        let indices = indices_sharing_self_prefix(k + 1);
        let mut inserted = Vec::new();
        for i in &indices {
            let c = contact(*i);
            inserted.push(c.clone());
            // Contacts in the self-prefix region must never trigger eviction.
            assert!(table.insert(c).is_none(), "split expected, not eviction");
        }

        assert!(table.buckets.len() > 1, "tail bucket should have split");
        assert_eq!(table.len(), k + 1);

        // The 20 closest to self are exactly the inserted set minus the
        // single farthest contact, in distance order.
        let me = self_id();
        sort_by_distance(&mut inserted, &me);
        let closest = table.closest(&me, k);
        assert_eq!(closest.len(), k);
        for (got, want) in closest.iter().zip(inserted.iter()) {
            assert_eq!(got.peer, want.peer);
        }
    }

    #[test]
    fn full_far_bucket_yields_pending_eviction() {
        let me = self_id();
        let mut table = RoutingTable::new(me, 1, 3);

        // Two contacts in the far half (depth 0) collide in a k=1 bucket
        // once the table has split at least once.
        let far: Vec<u32> = (0u32..)
            .filter(|i| bucket_index(&me, &contact(*i).kad_id()) == 0)
            .take(2)
            .collect();
        let near = indices_sharing_self_prefix(1)[0];

        table.insert(contact(near));
        assert!(table.insert(contact(far[0])).is_none());
        let pending = table
            .insert(contact(far[1]))
            .expect("full non-splittable bucket must defer to a ping");
        assert_eq!(pending.oldest.peer, contact(far[0]).peer);
        assert_eq!(pending.newcomer.peer, contact(far[1]).peer);

        // Incumbent alive: newcomer is dropped.
        table.apply_ping_result(pending.clone(), true);
        assert!(table.find(&contact(far[0]).peer).is_some());
        assert!(table.find(&contact(far[1]).peer).is_none());

        // Incumbent dead: newcomer replaces it.
        table.apply_ping_result(pending, false);
        assert!(table.find(&contact(far[0]).peer).is_none());
        assert!(table.find(&contact(far[1]).peer).is_some());
    }

    #[test]
    fn failures_past_threshold_evict_and_emit_events() {
        let mut table = RoutingTable::new(self_id(), 20, 3);
        let mut events = table.subscribe();
        let c = contact(7);
        table.insert(c.clone());

        table.record_failure(&c.peer);
        table.record_failure(&c.peer);
        assert!(table.find(&c.peer).is_some(), "below threshold");
        table.record_failure(&c.peer);
        assert!(table.find(&c.peer).is_none(), "threshold eviction");

        assert!(matches!(events.try_recv(), Ok(RoutingEvent::Added(added)) if added.peer == c.peer));
        assert!(matches!(events.try_recv(), Ok(RoutingEvent::Removed(peer)) if peer == c.peer));
    }

    #[test]
    fn refresh_resets_failure_count() {
        let mut table = RoutingTable::new(self_id(), 20, 3);
        let c = contact(7);
        table.insert(c.clone());
        table.record_failure(&c.peer);
        table.record_failure(&c.peer);

        // A successful round trip re-observes the contact.
        table.insert(c.clone());
        table.record_failure(&c.peer);
        table.record_failure(&c.peer);
        assert!(table.find(&c.peer).is_some());
    }

    #[test]
    fn stale_buckets_reports_quiet_regions() {
        let mut table = RoutingTable::new(self_id(), 20, 3);
        for i in 0..10 {
            table.insert(contact(i));
        }
        assert!(table.stale_buckets(Duration::from_secs(600)).is_empty());
        assert!(!table.stale_buckets(Duration::ZERO).is_empty());

        for idx in table.stale_buckets(Duration::ZERO) {
            table.mark_bucket_refreshed(idx);
        }
        assert!(table.stale_buckets(Duration::from_secs(1)).is_empty());
    }
}
