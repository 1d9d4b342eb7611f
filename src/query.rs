//! Disjoint-path iterative query engine.
//!
//! A query fans out over `α` paths. Each path owns a min-heap of unqueried
//! candidates ordered by XOR distance to the target and runs up to `β`
//! workers that repeatedly pop the closest candidate, issue one RPC through
//! the caller-supplied query function, and merge any closer peers the reply
//! names back into the heap. Paths stay disjoint through a global first-claim
//! set: the worker that pops a peer first owns it, other paths skip it.
//!
//! A path finishes when its heap runs dry with nothing in flight, or when the
//! `k` closest peers it knows of have all been queried and no candidate could
//! improve on them. The whole query finishes when a step reports
//! [`PathStep::Found`], when every path has finished, on the overall
//! deadline, or on caller cancellation. Cancellation is cooperative: workers
//! observe the token between steps and abandon in-flight RPCs, whose streams
//! the network layer reaps on its own timeout.

use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{KadError, Result};
use crate::id::{Contact, Distance, KadId, PeerId};

/// Outcome of querying one peer on a path.
pub enum PathStep {
    /// Keep going; merge these candidates into the path.
    CloserPeers(Vec<Contact>),
    /// The whole query is satisfied; `peer` is the winning result.
    Found { peer: Contact },
    /// This path is done, siblings continue.
    PathDone { closer: Vec<Contact> },
}

/// What one path did, for accounting and the disjointness guarantee.
#[derive(Clone, Debug)]
pub struct PathReport {
    /// The path produced the winning result or completed with at least one
    /// successful response.
    pub success: bool,
    /// Set when this path's query function returned the winning peer.
    pub found: Option<Contact>,
    /// Peers this path successfully queried, in query order.
    pub queried: Vec<PeerId>,
}

#[derive(Debug)]
pub struct QueryOutcome {
    pub paths: Vec<PathReport>,
    /// The `k` closest successfully queried peers across all paths.
    pub closest: Vec<Contact>,
    /// The winning peer, when some step returned [`PathStep::Found`].
    pub found: Option<Contact>,
    /// The overall deadline fired before the paths wound down.
    pub timed_out: bool,
}

/// One iterative lookup, parameterized the Kademlia way.
pub struct Query {
    pub target: KadId,
    /// Number of disjoint paths (`α`).
    pub paths: usize,
    /// Workers per path (`β`).
    pub parallelism: usize,
    /// Result width and stall horizon (`k`).
    pub width: usize,
    /// Overall deadline for the lookup.
    pub timeout: Duration,
    /// Our own peer id; replies naming it are never queried.
    pub local_peer: Option<PeerId>,
}

#[derive(Clone)]
struct Candidate {
    dist: Distance,
    contact: Contact,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}
impl Eq for Candidate {}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the BinaryHeap pops the closest candidate first.
        other.dist.cmp(&self.dist)
    }
}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct PathState {
    heap: BinaryHeap<Candidate>,
    /// Path-local dedupe: everything ever offered to this path.
    seen: HashSet<PeerId>,
    /// Successfully queried peers with their distances, in query order.
    queried: Vec<(Distance, Contact)>,
    in_flight: usize,
    complete: bool,
    found: Option<Contact>,
}

impl PathState {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seen: HashSet::new(),
            queried: Vec::new(),
            in_flight: 0,
            complete: false,
            found: None,
        }
    }

    fn offer(&mut self, contact: Contact, target: &KadId) {
        if self.seen.insert(contact.peer.clone()) {
            self.heap.push(Candidate {
                dist: contact.distance_to(target),
                contact,
            });
        }
    }

    fn record_success(&mut self, contact: Contact, target: &KadId) {
        let dist = contact.distance_to(target);
        self.queried.push((dist, contact));
    }

    /// The no-closer stall condition: the `width` closest peers this path has
    /// discovered are all queried already, and no remaining candidate can
    /// improve on them.
    fn is_stalled(&self, width: usize) -> bool {
        if self.queried.len() < width {
            return false;
        }
        let mut dists: Vec<Distance> = self.queried.iter().map(|(d, _)| *d).collect();
        dists.sort_unstable();
        let horizon = dists[width - 1];
        match self.heap.peek() {
            None => true,
            Some(best_candidate) => best_candidate.dist >= horizon,
        }
    }
}

struct Path {
    state: Mutex<PathState>,
    wake: Notify,
}

struct Shared {
    target: KadId,
    width: usize,
    local_peer: Option<PeerId>,
    /// First-claim arbitration: a peer in here belongs to exactly one path.
    claimed: Mutex<HashSet<PeerId>>,
    winner: Mutex<Option<Contact>>,
    cancel: CancellationToken,
}

impl Query {
    /// Run the lookup. `query_fn(path, peer)` performs one exchange with
    /// `peer` on behalf of `path` and classifies the reply as a [`PathStep`].
    ///
    /// Returns [`KadError::LookupFailed`] when `seeds` is empty and
    /// [`KadError::Cancelled`] when the caller's token fires; the overall
    /// timeout instead yields a partial [`QueryOutcome`] with `timed_out`
    /// set, since gathered results are still useful to most operations.
    pub async fn run<Q, F>(
        &self,
        seeds: Vec<Contact>,
        cancel: &CancellationToken,
        query_fn: Q,
    ) -> Result<QueryOutcome>
    where
        Q: Fn(usize, Contact) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = Result<PathStep>> + Send + 'static,
    {
        let mut seeds = seeds;
        if let Some(local) = &self.local_peer {
            seeds.retain(|c| &c.peer != local);
        }
        seeds.sort_by(|a, b| a.distance_to(&self.target).cmp(&b.distance_to(&self.target)));
        seeds.dedup_by(|a, b| a.peer == b.peer);
        if seeds.is_empty() {
            return Err(KadError::LookupFailed);
        }

        let num_paths = self.paths.max(1).min(seeds.len());
        let shared = Arc::new(Shared {
            target: self.target,
            width: self.width,
            local_peer: self.local_peer.clone(),
            claimed: Mutex::new(HashSet::new()),
            winner: Mutex::new(None),
            cancel: cancel.child_token(),
        });

        // Deal seeds round-robin by sorted order: path i gets positions
        // i, i+α, i+2α, … so every path starts near the target.
        let paths: Vec<Arc<Path>> = (0..num_paths)
            .map(|_| {
                Arc::new(Path {
                    state: Mutex::new(PathState::new()),
                    wake: Notify::new(),
                })
            })
            .collect();
        for (pos, seed) in seeds.into_iter().enumerate() {
            let path = &paths[pos % num_paths];
            path.state
                .lock()
                .expect("path state poisoned")
                .offer(seed, &self.target);
        }

        let mut workers = JoinSet::new();
        for (path_idx, path) in paths.iter().enumerate() {
            for _ in 0..self.parallelism.max(1) {
                workers.spawn(path_worker(
                    path_idx,
                    path.clone(),
                    shared.clone(),
                    query_fn.clone(),
                ));
            }
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;
        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    match joined {
                        Some(_) => continue,
                        None => break,
                    }
                }
                _ = &mut deadline => {
                    timed_out = true;
                    shared.cancel.cancel();
                    // Workers observe the token at their next checkpoint.
                    while workers.join_next().await.is_some() {}
                    break;
                }
                _ = cancel.cancelled() => {
                    shared.cancel.cancel();
                    while workers.join_next().await.is_some() {}
                    return Err(KadError::Cancelled);
                }
            }
        }

        let found = shared.winner.lock().expect("winner poisoned").clone();
        let mut reports = Vec::with_capacity(paths.len());
        let mut all_queried: Vec<(Distance, Contact)> = Vec::new();
        for path in &paths {
            let state = path.state.lock().expect("path state poisoned");
            let success = state.found.is_some() || (state.complete && !state.queried.is_empty());
            reports.push(PathReport {
                success,
                found: state.found.clone(),
                queried: state.queried.iter().map(|(_, c)| c.peer.clone()).collect(),
            });
            all_queried.extend(state.queried.iter().cloned());
        }

        all_queried.sort_by(|a, b| a.0.cmp(&b.0));
        let closest: Vec<Contact> = all_queried
            .into_iter()
            .map(|(_, c)| c)
            .take(self.width)
            .collect();

        debug!(
            target = %&self.target.to_hex()[..16],
            paths = reports.len(),
            found = found.is_some(),
            closest = closest.len(),
            timed_out,
            "query finished"
        );

        Ok(QueryOutcome {
            paths: reports,
            closest,
            found,
            timed_out,
        })
    }
}

enum NextMove {
    Query(Contact),
    Wait,
    Done,
}

async fn path_worker<Q, F>(path_idx: usize, path: Arc<Path>, shared: Arc<Shared>, query_fn: Q)
where
    Q: Fn(usize, Contact) -> F + Send + Sync,
    F: Future<Output = Result<PathStep>> + Send,
{
    loop {
        if shared.cancel.is_cancelled() {
            return;
        }

        // Pick the closest unclaimed candidate. The claim happens under the
        // path lock, so two paths racing the same discovery resolve to a
        // single owner.
        let (next, wake) = {
            let mut state = path.state.lock().expect("path state poisoned");
            if state.complete {
                (NextMove::Done, None)
            } else {
                let mut picked = None;
                while let Some(candidate) = state.heap.pop() {
                    let mut claimed = shared.claimed.lock().expect("claim set poisoned");
                    if claimed.insert(candidate.contact.peer.clone()) {
                        picked = Some(candidate.contact);
                        break;
                    }
                    // Claimed by a sibling path; skip and keep popping.
                }
                match picked {
                    Some(contact) => {
                        state.in_flight += 1;
                        (NextMove::Query(contact), None)
                    }
                    None if state.in_flight == 0 => {
                        state.complete = true;
                        (NextMove::Done, None)
                    }
                    // Candidates may still arrive from in-flight replies.
                    // Register for the wakeup before releasing the lock so
                    // a completion between unlock and await is not missed.
                    None => (NextMove::Wait, Some(path.wake.notified())),
                }
            }
        };

        match next {
            NextMove::Done => {
                path.wake.notify_waiters();
                return;
            }
            NextMove::Wait => {
                let wake = wake.expect("wait always carries a notified future");
                tokio::select! {
                    _ = wake => continue,
                    _ = shared.cancel.cancelled() => return,
                }
            }
            NextMove::Query(contact) => {
                let step = tokio::select! {
                    res = query_fn(path_idx, contact.clone()) => Some(res),
                    // Abandon the in-flight RPC; its stream is the network
                    // layer's to reap.
                    _ = shared.cancel.cancelled() => None,
                };
                let Some(step) = step else { return };

                let mut state = path.state.lock().expect("path state poisoned");
                state.in_flight -= 1;
                match step {
                    Ok(PathStep::CloserPeers(peers)) => {
                        state.record_success(contact, &shared.target);
                        merge_candidates(&mut state, peers, &shared);
                    }
                    Ok(PathStep::Found { peer }) => {
                        state.record_success(contact, &shared.target);
                        state.found = Some(peer.clone());
                        state.complete = true;
                        *shared.winner.lock().expect("winner poisoned") = Some(peer);
                        shared.cancel.cancel();
                    }
                    Ok(PathStep::PathDone { closer }) => {
                        state.record_success(contact, &shared.target);
                        merge_candidates(&mut state, closer, &shared);
                        state.complete = true;
                    }
                    Err(err) => {
                        trace!(path = path_idx, peer = %contact.peer, error = %err, "path peer failed");
                    }
                }
                if !state.complete && state.is_stalled(shared.width) {
                    trace!(path = path_idx, queried = state.queried.len(), "path stalled, no closer candidates");
                    state.complete = true;
                }
                drop(state);
                path.wake.notify_waiters();
            }
        }
    }
}

fn merge_candidates(state: &mut PathState, peers: Vec<Contact>, shared: &Shared) {
    for peer in peers {
        if let Some(local) = &shared.local_peer
            && &peer.peer == local
        {
            continue;
        }
        state.offer(peer, &shared.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn contact(index: u32) -> Contact {
        Contact::new(
            PeerId::from_bytes(format!("peer-{index}").into_bytes()),
            vec![format!("/ip4/10.0.0.{}/tcp/4001", index % 250 + 1)],
        )
    }

    fn query(target: KadId) -> Query {
        Query {
            target,
            paths: 3,
            parallelism: 3,
            width: 20,
            timeout: Duration::from_secs(5),
            local_peer: None,
        }
    }

    /// A static topology: every peer knows a fixed set of neighbours.
    fn topology(n: u32, fanout: u32) -> HashMap<PeerId, Vec<Contact>> {
        let mut map = HashMap::new();
        for i in 0..n {
            let neighbours: Vec<Contact> = (1..=fanout).map(|j| contact((i + j) % n)).collect();
            map.insert(contact(i).peer, neighbours);
        }
        map
    }

    #[tokio::test]
    async fn query_without_seeds_fails_lookup() {
        let q = query(KadId::from_bytes_digest(b"t"));
        let cancel = CancellationToken::new();
        let result = q
            .run(Vec::new(), &cancel, |_, _c| async { Ok(PathStep::CloserPeers(Vec::new())) })
            .await;
        assert!(matches!(result, Err(KadError::LookupFailed)));
    }

    #[tokio::test]
    async fn paths_have_disjoint_queried_sets() {
        let target = KadId::from_bytes_digest(b"target-key");
        let topo = Arc::new(topology(64, 8));
        let q = query(target);
        let cancel = CancellationToken::new();

        let seeds: Vec<Contact> = (0..12).map(contact).collect();
        let topo_for_fn = topo.clone();
        let outcome = q
            .run(seeds, &cancel, move |_, peer| {
                let topo = topo_for_fn.clone();
                async move {
                    Ok(PathStep::CloserPeers(
                        topo.get(&peer.peer).cloned().unwrap_or_default(),
                    ))
                }
            })
            .await
            .expect("query runs");

        assert_eq!(outcome.paths.len(), 3);
        for (i, a) in outcome.paths.iter().enumerate() {
            for b in outcome.paths.iter().skip(i + 1) {
                let set_a: HashSet<_> = a.queried.iter().collect();
                let overlap = b.queried.iter().filter(|p| set_a.contains(p)).count();
                assert_eq!(overlap, 0, "paths must stay disjoint");
            }
        }
        assert!(!outcome.closest.is_empty());
        assert!(outcome.closest.len() <= 20);
    }

    #[tokio::test]
    async fn within_a_path_queries_run_best_first() {
        let target = KadId::from_bytes_digest(b"target-key");
        let q = Query { paths: 1, parallelism: 1, ..query(target) };
        let cancel = CancellationToken::new();

        let order: Arc<Mutex<Vec<Distance>>> = Arc::new(Mutex::new(Vec::new()));
        let order_for_fn = order.clone();
        let seeds: Vec<Contact> = (0..16).map(contact).collect();
        q.run(seeds, &cancel, move |_, peer| {
            let order = order_for_fn.clone();
            async move {
                order.lock().unwrap().push(peer.distance_to(&target));
                Ok(PathStep::CloserPeers(Vec::new()))
            }
        })
        .await
        .expect("query runs");

        let order = order.lock().unwrap();
        assert!(order.len() >= 2);
        for pair in order.windows(2) {
            assert!(pair[0] <= pair[1], "single-worker path must query best-first");
        }
    }

    #[tokio::test]
    async fn found_terminates_all_paths_early() {
        let target = KadId::from_bytes_digest(b"target-key");
        let winner = contact(999);
        let q = query(target);
        let cancel = CancellationToken::new();

        let queried = Arc::new(Mutex::new(0usize));
        let queried_for_fn = queried.clone();
        let winner_for_fn = winner.clone();
        let seeds: Vec<Contact> = (0..9).map(contact).collect();
        let outcome = q
            .run(seeds, &cancel, move |_, peer| {
                let queried = queried_for_fn.clone();
                let winner = winner_for_fn.clone();
                async move {
                    *queried.lock().unwrap() += 1;
                    if peer.peer == contact(0).peer {
                        Ok(PathStep::Found { peer: winner })
                    } else {
                        // Endless candidate churn unless the win cancels us.
                        Ok(PathStep::CloserPeers((1000..1008).map(contact).collect()))
                    }
                }
            })
            .await
            .expect("query runs");

        assert_eq!(outcome.found.expect("winner").peer, winner.peer);
        assert!(outcome.paths.iter().any(|p| p.found.is_some()));
        assert!(
            *queried.lock().unwrap() < 100,
            "a win must stop sibling paths promptly"
        );
    }

    #[tokio::test]
    async fn peer_failures_do_not_kill_the_path() {
        let target = KadId::from_bytes_digest(b"target-key");
        let q = Query { paths: 1, parallelism: 2, ..query(target) };
        let cancel = CancellationToken::new();

        let seeds: Vec<Contact> = (0..6).map(contact).collect();
        let bad = contact(0).peer;
        let outcome = q
            .run(seeds, &cancel, move |_, peer| {
                let bad = bad.clone();
                async move {
                    if peer.peer == bad {
                        Err(KadError::Transport("connection refused".into()))
                    } else {
                        Ok(PathStep::CloserPeers(Vec::new()))
                    }
                }
            })
            .await
            .expect("query runs");

        assert_eq!(outcome.paths.len(), 1);
        assert_eq!(outcome.paths[0].queried.len(), 5, "five of six peers answer");
        assert!(outcome.paths[0].success);
    }

    #[tokio::test]
    async fn caller_cancellation_surfaces_as_cancelled() {
        let target = KadId::from_bytes_digest(b"target-key");
        let q = query(target);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let seeds: Vec<Contact> = (0..3).map(contact).collect();
        let result = q
            .run(seeds, &cancel, move |_, _peer| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(PathStep::CloserPeers(Vec::new()))
            })
            .await;
        assert!(matches!(result, Err(KadError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_returns_partial_results() {
        let target = KadId::from_bytes_digest(b"target-key");
        let q = Query { timeout: Duration::from_millis(500), ..query(target) };
        let cancel = CancellationToken::new();

        let seeds: Vec<Contact> = (0..6).map(contact).collect();
        let outcome = q
            .run(seeds, &cancel, move |_, peer| async move {
                if peer.peer == contact(5).peer {
                    // One peer hangs far past the deadline.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(PathStep::CloserPeers(Vec::new()))
            })
            .await
            .expect("query returns partial outcome");

        assert!(outcome.timed_out);
        assert!(outcome.paths.iter().map(|p| p.queried.len()).sum::<usize>() >= 5);
    }
}
