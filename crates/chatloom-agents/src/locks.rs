use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Per-conversation mutual exclusion shared by turn processing and
/// conversation deletion. Entries are dropped once nobody holds or waits on them.
#[derive(Clone, Default)]
pub struct ConversationLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` while holding the lock for `conversation_id`.
    pub async fn run_locked<F: Future>(&self, conversation_id: &str, work: F) -> F::Output {
        let lock = Arc::clone(
            self.inner
                .entry(conversation_id.to_string())
                .or_default()
                .value(),
        );
        let output = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);
        self.inner
            .remove_if(conversation_id, |_, lock| Arc::strong_count(lock) == 1);
        output
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
