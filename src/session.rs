use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::queue::{QueueError, RequestIdQueue};

/// TTL-bounded cache of per-conversation interface handles (whatever the
/// chat layer keeps per conversation: history cursor, model binding, …).
/// The conversation queue's concurrency bound of 1 is what makes the
/// cached value safe to mutate without its own lock.
#[derive(Debug)]
pub struct ConversationStore<T: Send + Sync + 'static> {
    cache: Cache<String, Arc<T>>,
}

impl<T: Send + Sync + 'static> Clone for ConversationStore<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> ConversationStore<T> {
    /// Creates a new store with the given idle TTL in seconds.
    pub fn new(ttl_secs: u64) -> Self {
        let cache = Cache::builder()
            .time_to_idle(Duration::from_secs(ttl_secs))
            .eviction_listener(|key: Arc<String>, _value, cause| {
                info!("Conversation expired: key={}, cause={:?}", key, cause);
            })
            .build();
        Self { cache }
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Arc<T>> {
        self.cache.get(conversation_id).await
    }

    /// Returns the existing handle or builds one with `init`.
    pub async fn get_or_create<F>(&self, conversation_id: &str, init: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        match self.cache.get(conversation_id).await {
            Some(existing) => existing,
            None => {
                let fresh = Arc::new(init());
                self.cache
                    .insert(conversation_id.to_string(), fresh.clone())
                    .await;
                fresh
            }
        }
    }

    pub async fn remove(&self, conversation_id: &str) {
        self.cache.invalidate(conversation_id).await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

/// Admission for one chat turn under both partition keys: the platform
/// (bounded at its configured concurrency) and the conversation (bounded
/// at exactly 1, serializing turns that share history state). Dropping
/// the guard releases both entries, on success and error paths alike.
pub struct TurnGuard {
    platform_queue: RequestIdQueue<String>,
    conversation_queue: RequestIdQueue<String>,
    platform: String,
    conversation: String,
    request_id: String,
}

impl TurnGuard {
    pub async fn acquire(
        platform_queue: &RequestIdQueue<String>,
        conversation_queue: &RequestIdQueue<String>,
        platform: &str,
        conversation: &str,
        request_id: &str,
        platform_limit: usize,
        token: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<TurnGuard, QueueError> {
        platform_queue.add(&platform.to_string(), request_id);
        conversation_queue.add(&conversation.to_string(), request_id);

        // wait() releases its own entry on cancel/timeout; only the other
        // queue's entry needs cleaning up here
        if let Err(e) = platform_queue
            .wait(&platform.to_string(), request_id, platform_limit, token, timeout)
            .await
        {
            conversation_queue.remove(&conversation.to_string(), request_id);
            return Err(e);
        }
        if let Err(e) = conversation_queue
            .wait(&conversation.to_string(), request_id, 1, token, timeout)
            .await
        {
            platform_queue.remove(&platform.to_string(), request_id);
            return Err(e);
        }

        Ok(TurnGuard {
            platform_queue: platform_queue.clone(),
            conversation_queue: conversation_queue.clone(),
            platform: platform.to_string(),
            conversation: conversation.to_string(),
            request_id: request_id.to_string(),
        })
    }

    /// How many requests sit ahead of or alongside this one on the
    /// platform, for "N requests ahead of you" notices.
    pub fn platform_queue_length(&self) -> usize {
        self.platform_queue.queue_length(&self.platform)
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.platform_queue.remove(&self.platform, &self.request_id);
        self.conversation_queue
            .remove(&self.conversation, &self.request_id);
    }
}
