use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::ConversationId,
    messaging::port::{MessagingCapabilities, MessagingPort},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound replies (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between replies to the same conversation.
    pub per_conversation_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_conversation_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// MessagingPort decorator that spaces out acknowledgments.
///
/// Many buffers for different conversations can finish in the same poll; this
/// keeps the burst under platform flood limits.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_conversation: Mutex<HashMap<ConversationId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_conversation: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter of `conversation`. Limiters of other conversations whose next
    /// slot has already passed are dropped: a fresh limiter behaves the same,
    /// so the map only holds conversations replied to within the interval.
    async fn limiter_for(&self, conversation: &ConversationId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_conversation.lock().await;
        let now = Instant::now();
        map.retain(|id, lim| {
            id == conversation
                || Arc::strong_count(lim) > 1
                || lim.try_lock().map_or(true, |l| l.next > now)
        });
        map.entry(conversation.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_conversation_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle(&self, conversation: &ConversationId) {
        let global_wait = { self.global.lock().await.reserve() };
        let conversation_wait = {
            let lim = self.limiter_for(conversation).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(conversation_wait);
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_reply(&self, conversation: &ConversationId, text: &str) -> Result<()> {
        self.throttle(conversation).await;
        self.inner.send_reply(conversation, text).await
    }
}
