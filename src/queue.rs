use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("admission wait was cancelled")]
    Cancelled,
    #[error("admission wait timed out")]
    TimedOut,
}

/// Per-key FIFO admission control with a concurrency bound.
///
/// A request id is appended with [`add`](Self::add), admitted once it sits
/// within the first `max_concurrent` not-yet-removed entries for its key,
/// and released with [`remove`](Self::remove), which wakes the remaining
/// waiters. Admission is positional, so an id added earlier is never
/// overtaken by one added later, no matter which waiter's wakeup resolves
/// first.
///
/// The key type is generic: the same queue serves platform partitions
/// (bound N) and conversation partitions (bound 1) unmodified.
#[derive(Clone)]
pub struct RequestIdQueue<K> {
    inner: Arc<Mutex<HashMap<K, VecDeque<String>>>>,
    notify: Arc<Notify>,
}

impl<K> RequestIdQueue<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append `id` to the key's pending list.
    pub fn add(&self, key: &K, id: &str) {
        let mut map = self.inner.lock().unwrap();
        map.entry(key.clone())
            .or_default()
            .push_back(id.to_string());
    }

    /// Number of pending (not yet removed) entries for the key, admitted
    /// ones included.
    pub fn queue_length(&self, key: &K) -> usize {
        let map = self.inner.lock().unwrap();
        map.get(key).map_or(0, |list| list.len())
    }

    /// Remove `id` from the key's list and wake every waiter so the next
    /// entries can re-check their position.
    pub fn remove(&self, key: &K, id: &str) {
        let mut map = self.inner.lock().unwrap();
        if let Some(list) = map.get_mut(key) {
            if let Some(pos) = list.iter().position(|entry| entry == id) {
                list.remove(pos);
            }
            if list.is_empty() {
                map.remove(key);
            }
        }
        drop(map);
        self.notify.notify_waiters();
    }

    fn admitted(&self, key: &K, id: &str, max_concurrent: usize) -> bool {
        let map = self.inner.lock().unwrap();
        match map.get(key) {
            // an id that is not queued cannot be holding anyone back
            None => true,
            Some(list) => match list.iter().position(|entry| entry == id) {
                None => true,
                Some(pos) => pos < max_concurrent,
            },
        }
    }

    /// Suspend until `id` is within the first `max_concurrent` entries
    /// for `key`. Cancellation and the optional timeout unblock eagerly;
    /// on either failure the entry is removed so later waiters are not
    /// stalled behind it.
    pub async fn wait(
        &self,
        key: &K,
        id: &str,
        max_concurrent: usize,
        token: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<(), QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // grab the notified future before checking, so a remove()
            // between the check and the await cannot be missed
            let notified = self.notify.notified();
            if self.admitted(key, id, max_concurrent) {
                return Ok(());
            }
            debug!(position = self.queue_length(key), "waiting for admission");

            let woken = async {
                match deadline {
                    Some(at) => tokio::time::timeout_at(at, notified).await.is_ok(),
                    None => {
                        notified.await;
                        true
                    }
                }
            };
            tokio::select! {
                woken = woken => {
                    if !woken {
                        self.remove(key, id);
                        return Err(QueueError::TimedOut);
                    }
                }
                _ = token.cancelled() => {
                    self.remove(key, id);
                    return Err(QueueError::Cancelled);
                }
            }
        }
    }
}

impl<K> Default for RequestIdQueue<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for RequestIdQueue<K>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.inner.lock().unwrap();
        f.debug_struct("RequestIdQueue")
            .field("keys", &map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    fn queue() -> RequestIdQueue<String> {
        RequestIdQueue::new()
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_queue_length_counts_pending() {
        let q = queue();
        let key = "telegram".to_string();
        assert_eq!(q.queue_length(&key), 0);

        q.add(&key, "a");
        q.add(&key, "b");
        assert_eq!(q.queue_length(&key), 2);

        q.remove(&key, "a");
        assert_eq!(q.queue_length(&key), 1);
    }

    // with a bound of 2, `a` and `b` pass, `c` needs a slot.
    #[tokio::test]
    async fn test_bounded_admission() {
        let q = queue();
        let key = "openai".to_string();
        q.add(&key, "a");
        q.add(&key, "b");
        q.add(&key, "c");

        q.wait(&key, "a", 2, &token(), None).await.unwrap();
        q.wait(&key, "b", 2, &token(), None).await.unwrap();

        let blocked = q
            .wait(&key, "c", 2, &token(), Some(Duration::from_millis(50)))
            .await;
        assert_eq!(blocked, Err(QueueError::TimedOut));

        // re-add and free a slot: c now passes
        q.add(&key, "c");
        q.remove(&key, "a");
        q.wait(&key, "c", 2, &token(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
    }

    // with a bound of 1 the completion order is exactly the add
    // order, regardless of wakeup timing.
    #[tokio::test]
    async fn test_fifo_fairness() {
        let q = queue();
        let key = "conv-1".to_string();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in ["a", "b", "c"] {
            q.add(&key, id);
        }

        let mut tasks = Vec::new();
        // spawn in reverse so wakeup order cannot accidentally match
        for id in ["c", "b", "a"] {
            let q = q.clone();
            let key = key.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                q.wait(&key, id, 1, &CancellationToken::new(), None)
                    .await
                    .unwrap();
                order.lock().unwrap().push(id.to_string());
                sleep(Duration::from_millis(10)).await;
                q.remove(&key, id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(
            order.lock().unwrap().clone(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    // never more than N admitted at once.
    #[tokio::test]
    async fn test_concurrency_bound_holds() {
        let q = queue();
        let key = "platform".to_string();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let ids: Vec<String> = (0..8).map(|i| format!("req-{i}")).collect();
        for id in &ids {
            q.add(&key, id);
        }

        let mut tasks = Vec::new();
        for id in ids {
            let q = q.clone();
            let key = key.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                q.wait(&key, &id, 3, &CancellationToken::new(), None)
                    .await
                    .unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                q.remove(&key, &id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    // cancellation unblocks eagerly and releases the entry.
    #[tokio::test]
    async fn test_cancel_releases_entry() {
        let q = queue();
        let key = "conv-2".to_string();
        q.add(&key, "first");
        q.add(&key, "second");

        let cancel = token();
        let waiter = {
            let q = q.clone();
            let key = key.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.wait(&key, "second", 1, &cancel, None).await })
        };
        sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(QueueError::Cancelled));
        // the cancelled entry no longer occupies a slot
        assert_eq!(q.queue_length(&key), 1);
    }

    // keys are independent partitions
    #[tokio::test]
    async fn test_keys_are_independent() {
        let q = queue();
        let a = "platform-a".to_string();
        let b = "platform-b".to_string();
        q.add(&a, "x");
        q.add(&a, "y");
        q.add(&b, "z");

        // `a` is saturated at bound 1, but `b` admits immediately
        q.wait(&b, "z", 1, &token(), Some(Duration::from_millis(50)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_without_add_is_admitted() {
        let q = queue();
        let key = "conv-3".to_string();
        q.wait(&key, "ghost", 1, &token(), None).await.unwrap();
    }
}
