//! Request pipeline over the transport port.
//!
//! [`RpcClient`] wraps the embedder's [`KadRpc`] with the policies the core
//! owns: a per-request deadline, a per-peer in-flight cap, and liveness
//! accounting. Every successful exchange reports the contact alive; every
//! failure or timeout bumps its failure counter. The reports flow to the node
//! actor over a channel, so the pipeline itself never touches routing state.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Duration, timeout};
use tracing::trace;

use crate::error::{KadError, Result};
use crate::id::{Contact, ConnectionType, PeerId};
use crate::messages::Message;
use crate::protocols::KadRpc;

/// Peers we keep an in-flight semaphore for. Evicting a hot peer's entry
/// only resets its cap, so a plain LRU bound is enough.
const MAX_TRACKED_PEERS: usize = 4096;

/// Liveness observations emitted by the pipeline, consumed by the node actor.
#[derive(Clone, Debug)]
pub enum LivenessEvent {
    /// The peer answered a request; observe it as a live contact.
    Alive(Contact),
    /// The peer failed or timed out; bump its failure counter.
    Failed(PeerId),
}

pub struct RpcClient<N: KadRpc> {
    rpc: Arc<N>,
    request_timeout: Duration,
    inflight_cap: usize,
    semaphores: Mutex<LruCache<PeerId, Arc<Semaphore>>>,
    feedback: mpsc::UnboundedSender<LivenessEvent>,
}

impl<N: KadRpc> RpcClient<N> {
    pub fn new(
        rpc: Arc<N>,
        request_timeout: Duration,
        inflight_cap: usize,
    ) -> (Self, mpsc::UnboundedReceiver<LivenessEvent>) {
        let (feedback, feedback_rx) = mpsc::unbounded_channel();
        let cap = NonZeroUsize::new(MAX_TRACKED_PEERS).expect("capacity must be non-zero");
        (
            Self {
                rpc,
                request_timeout,
                inflight_cap: inflight_cap.max(1),
                semaphores: Mutex::new(LruCache::new(cap)),
                feedback,
            },
            feedback_rx,
        )
    }

    fn semaphore_for(&self, peer: &PeerId) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().expect("semaphore map poisoned");
        semaphores
            .get_or_insert_mut(peer.clone(), || Arc::new(Semaphore::new(self.inflight_cap)))
            .clone()
    }

    fn report(&self, event: LivenessEvent) {
        // The actor may already be gone during shutdown; nothing to do then.
        let _ = self.feedback.send(event);
    }

    /// One request/response exchange with `to`, bounded by the per-request
    /// deadline and the per-peer in-flight cap.
    pub async fn request(&self, to: &Contact, msg: Message) -> Result<Message> {
        let semaphore = self.semaphore_for(&to.peer);
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| KadError::Cancelled)?;

        match timeout(self.request_timeout, self.rpc.request(to, msg)).await {
            Ok(Ok(response)) => {
                self.report(LivenessEvent::Alive(
                    to.clone().with_connection(ConnectionType::Connected),
                ));
                Ok(response)
            }
            Ok(Err(err)) => {
                trace!(peer = %to.peer, error = %err, "request failed");
                self.report(LivenessEvent::Failed(to.peer.clone()));
                Err(err)
            }
            Err(_) => {
                trace!(peer = %to.peer, timeout_ms = self.request_timeout.as_millis() as u64, "request timed out");
                self.report(LivenessEvent::Failed(to.peer.clone()));
                Err(KadError::Timeout(self.request_timeout))
            }
        }
    }

    /// Fire-and-forget notification. Failures only feed the liveness
    /// counters; the caller has nothing to await on.
    pub async fn notify(&self, to: &Contact, msg: Message) -> Result<()> {
        let semaphore = self.semaphore_for(&to.peer);
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| KadError::Cancelled)?;

        match timeout(self.request_timeout, self.rpc.notify(to, msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.report(LivenessEvent::Failed(to.peer.clone()));
                Err(err)
            }
            Err(_) => {
                self.report(LivenessEvent::Failed(to.peer.clone()));
                Err(KadError::Timeout(self.request_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowRpc {
        inflight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl KadRpc for SlowRpc {
        async fn request(&self, _to: &Contact, msg: Message) -> Result<Message> {
            let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(KadError::Transport("boom".into()))
            } else {
                Ok(msg)
            }
        }

        async fn notify(&self, _to: &Contact, _msg: Message) -> Result<()> {
            Ok(())
        }
    }

    fn contact() -> Contact {
        Contact::new(PeerId::from_bytes(b"peer".to_vec()), vec!["/ip4/10.0.0.1/tcp/4001".into()])
    }

    #[tokio::test]
    async fn success_reports_the_contact_alive() {
        let rpc = Arc::new(SlowRpc {
            inflight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: false,
        });
        let (client, mut feedback) = RpcClient::new(rpc, Duration::from_secs(1), 4);

        client.request(&contact(), Message::ping()).await.expect("request");
        match feedback.recv().await {
            Some(LivenessEvent::Alive(c)) => {
                assert_eq!(c.peer, contact().peer);
                assert_eq!(c.connection, ConnectionType::Connected);
            }
            other => panic!("expected Alive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_and_timeout_report_the_peer_failed() {
        let rpc = Arc::new(SlowRpc {
            inflight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: true,
        });
        let (client, mut feedback) = RpcClient::new(rpc, Duration::from_secs(1), 4);
        assert!(client.request(&contact(), Message::ping()).await.is_err());
        assert!(matches!(feedback.recv().await, Some(LivenessEvent::Failed(_))));

        let rpc = Arc::new(SlowRpc {
            inflight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::from_secs(60),
            fail: false,
        });
        let (client, mut feedback) = RpcClient::new(rpc, Duration::from_millis(20), 4);
        let err = client.request(&contact(), Message::ping()).await;
        assert!(matches!(err, Err(KadError::Timeout(_))));
        assert!(matches!(feedback.recv().await, Some(LivenessEvent::Failed(_))));
    }

    #[tokio::test]
    async fn per_peer_inflight_is_capped() {
        let rpc = Arc::new(SlowRpc {
            inflight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::from_millis(30),
            fail: false,
        });
        let (client, _feedback) = RpcClient::new(rpc.clone(), Duration::from_secs(5), 2);
        let client = Arc::new(client);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let client = client.clone();
            tasks.spawn(async move { client.request(&contact(), Message::ping()).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("join").expect("request");
        }

        assert!(rpc.peak.load(Ordering::SeqCst) <= 2, "cap of 2 exceeded");
    }
}
