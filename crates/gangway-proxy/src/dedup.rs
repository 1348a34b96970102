//! In-flight request deduplication.
//!
//! Concurrent identical GET requests collapse into one upstream call: the
//! first request for a key becomes the leader, everyone else waits and
//! synthesizes a fresh response from the leader's published result. A failed
//! leader does not doom its waiters - they observe the failure and retry
//! independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

/// Grace window before a published entry is removed, letting identical
/// requests admitted around completion still observe the result.
const CLEANUP_GRACE: Duration = Duration::from_millis(100);

/// The leader's published result, shared by all waiters.
#[derive(Debug, Clone)]
pub struct SharedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

type Outcome = Result<SharedResponse, String>;
type Slot = Option<Outcome>;

/// Map of in-flight GET requests, at most one entry per key.
#[derive(Debug, Default)]
pub struct PendingMap {
    inner: Mutex<HashMap<String, watch::Receiver<Slot>>>,
}

/// Result of asking to join an in-flight request.
pub enum Admission {
    /// No identical request in flight: caller must perform the upstream
    /// call and publish its outcome.
    Leader(Publisher),
    /// An identical request is in flight: wait for its outcome.
    Waiter(Waiter),
}

/// Leader-side handle. Publishing consumes it; dropping it unpublished
/// releases the waiters with an error so nobody hangs.
pub struct Publisher {
    map: Arc<PendingMap>,
    key: String,
    tx: Option<watch::Sender<Slot>>,
}

/// Waiter-side handle for one in-flight key.
pub struct Waiter {
    rx: watch::Receiver<Slot>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the in-flight request for `key`, creating it if absent.
    pub fn admit(self: &Arc<Self>, key: &str) -> Admission {
        let mut inner = self.inner.lock();
        if let Some(rx) = inner.get(key) {
            return Admission::Waiter(Waiter { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(None);
        inner.insert(key.to_string(), rx);
        Admission::Leader(Publisher {
            map: Arc::clone(self),
            key: key.to_string(),
            tx: Some(tx),
        })
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn remove(&self, key: &str) {
        self.inner.lock().remove(key);
    }
}

impl Publisher {
    /// Publishes the leader's outcome and schedules entry removal after the
    /// grace window.
    pub fn publish(mut self, outcome: Outcome) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(outcome));
            let map = Arc::clone(&self.map);
            let key = std::mem::take(&mut self.key);
            tokio::spawn(async move {
                tokio::time::sleep(CLEANUP_GRACE).await;
                map.remove(&key);
                tracing::debug!(key = %&key[..key.len().min(16)], "pending request cleaned up");
            });
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        // Leader aborted without publishing: release waiters immediately.
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err("original request aborted".to_string())));
            self.map.remove(&self.key);
        }
    }
}

impl Waiter {
    /// Waits for the leader's outcome.
    pub async fn wait(mut self) -> Outcome {
        let result = self
            .rx
            .wait_for(|slot| slot.is_some())
            .await
            .map(|slot| slot.clone().expect("slot checked non-empty"));

        match result {
            Ok(outcome) => outcome,
            // Sender dropped without a value; treat like a leader abort.
            Err(_) => Err("original request aborted".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> SharedResponse {
        SharedResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    #[tokio::test]
    async fn single_leader_per_key() {
        let map = Arc::new(PendingMap::new());
        let first = map.admit("k");
        assert!(matches!(first, Admission::Leader(_)));
        let second = map.admit("k");
        assert!(matches!(second, Admission::Waiter(_)));
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn waiters_observe_leader_result() {
        let map = Arc::new(PendingMap::new());
        let Admission::Leader(publisher) = map.admit("k") else {
            panic!("expected leader");
        };

        let mut handles = Vec::new();
        for _ in 0..5 {
            let Admission::Waiter(waiter) = map.admit("k") else {
                panic!("expected waiter");
            };
            handles.push(tokio::spawn(waiter.wait()));
        }

        publisher.publish(Ok(response("shared")));

        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert_eq!(outcome.status, 200);
            assert_eq!(outcome.body, Bytes::from("shared"));
        }
    }

    #[tokio::test]
    async fn waiters_observe_leader_failure() {
        let map = Arc::new(PendingMap::new());
        let Admission::Leader(publisher) = map.admit("k") else {
            panic!("expected leader");
        };
        let Admission::Waiter(waiter) = map.admit("k") else {
            panic!("expected waiter");
        };

        publisher.publish(Err("upstream exploded".to_string()));

        let outcome = waiter.wait().await;
        assert_eq!(outcome.unwrap_err(), "upstream exploded");
    }

    #[tokio::test]
    async fn dropped_leader_releases_waiters() {
        let map = Arc::new(PendingMap::new());
        let Admission::Leader(publisher) = map.admit("k") else {
            panic!("expected leader");
        };
        let Admission::Waiter(waiter) = map.admit("k") else {
            panic!("expected waiter");
        };

        drop(publisher);

        let outcome = waiter.wait().await;
        assert!(outcome.is_err());
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn entry_removed_after_grace() {
        let map = Arc::new(PendingMap::new());
        let Admission::Leader(publisher) = map.admit("k") else {
            panic!("expected leader");
        };
        publisher.publish(Ok(response("x")));

        tokio::time::sleep(CLEANUP_GRACE + Duration::from_millis(50)).await;
        assert!(map.is_empty());

        // A new request for the same key leads again.
        assert!(matches!(map.admit("k"), Admission::Leader(_)));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share() {
        let map = Arc::new(PendingMap::new());
        let a = map.admit("a");
        let b = map.admit("b");
        assert!(matches!(a, Admission::Leader(_)));
        assert!(matches!(b, Admission::Leader(_)));
        assert_eq!(map.len(), 2);
    }
}
