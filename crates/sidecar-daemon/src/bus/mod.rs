//! Per-agent event queue between the backend and the relay.
//!
//! Single producer (the agent) and single consumer (the relay of the active
//! turn). The consumer is woken on publish instead of polling. Request-type
//! events are paired with a response slot keyed by prompt id; the backend
//! side blocks on [`EventBus::request`] until the relay calls
//! [`EventBus::provide_response`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

use sidecar_core::protocol::{AgentEvent, InteractionKind, UserResponse};

/// Events retained while no consumer is attached.
pub const DEFAULT_DETACHED_CAPACITY: usize = 1024;

struct Waiter {
    kind: InteractionKind,
    tx: oneshot::Sender<UserResponse>,
}

struct Inner {
    queue: Mutex<VecDeque<AgentEvent>>,
    notify: Notify,
    consumer_attached: AtomicBool,
    waiters: Mutex<HashMap<String, Waiter>>,
    detached_capacity: usize,
}

/// Cloneable handle to one agent's event queue.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("len", &self.len())
            .field("consumer_attached", &self.is_consumer_attached())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_DETACHED_CAPACITY)
    }
}

impl EventBus {
    pub fn new(detached_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                consumer_attached: AtomicBool::new(false),
                waiters: Mutex::new(HashMap::new()),
                detached_capacity,
            }),
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<AgentEvent>> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event and wake the consumer.
    ///
    /// While detached the backlog is bounded; the oldest event is dropped
    /// when the bound is exceeded.
    pub fn publish(&self, event: AgentEvent) {
        let attached = self.is_consumer_attached();
        let dropped = {
            let mut queue = self.queue();
            queue.push_back(event);
            if !attached && queue.len() > self.inner.detached_capacity {
                queue.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = dropped {
            warn!(
                event_kind = old.kind(),
                capacity = self.inner.detached_capacity,
                "No consumer attached, dropped oldest queued event"
            );
        }
        self.inner.notify.notify_one();
    }

    /// Dequeue without waiting.
    pub fn try_next(&self) -> Option<AgentEvent> {
        self.queue().pop_front()
    }

    /// Dequeue, waiting for a publish when the queue is empty.
    ///
    /// Cancel-safe: dropping the future never loses an event.
    pub async fn next(&self) -> AgentEvent {
        loop {
            if let Some(event) = self.try_next() {
                return event;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Drop everything still queued. Returns how many events were discarded.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue();
        let n = queue.len();
        queue.clear();
        n
    }

    pub fn is_consumer_attached(&self) -> bool {
        self.inner.consumer_attached.load(Ordering::Acquire)
    }

    /// Mark a consumer as attached for the lifetime of the returned guard.
    pub fn attach(&self) -> ConsumerGuard {
        self.inner.consumer_attached.store(true, Ordering::Release);
        debug!("Event consumer attached");
        ConsumerGuard { bus: self.clone() }
    }

    /// Publish a request-type event and wait for the consumer's answer.
    ///
    /// Without an attached consumer nobody can answer, so the kind's
    /// default response is returned immediately and nothing is queued.
    /// Non-request events are published and answered with `None`.
    pub async fn request(&self, event: AgentEvent) -> Option<UserResponse> {
        let Some((prompt_id, kind)) = event.interaction() else {
            self.publish(event);
            return None;
        };
        let prompt_id = prompt_id.to_string();

        if !self.is_consumer_attached() {
            debug!(prompt_id, %kind, "No consumer attached, answering request with default");
            return Some(UserResponse::default_for(kind, prompt_id));
        }

        let (tx, rx) = oneshot::channel();
        self.waiters().insert(prompt_id.clone(), Waiter { kind, tx });
        if !self.is_consumer_attached() {
            self.waiters().remove(&prompt_id);
            return Some(UserResponse::default_for(kind, prompt_id));
        }
        self.publish(event);

        Some(
            rx.await
                .unwrap_or_else(|_| UserResponse::default_for(kind, prompt_id)),
        )
    }

    /// Hand a response to the backend waiting on its prompt id.
    /// Returns `false` when nobody is waiting for it.
    pub fn provide_response(&self, response: UserResponse) -> bool {
        let waiter = self.waiters().remove(response.prompt_id());
        match waiter {
            Some(waiter) => waiter.tx.send(response).is_ok(),
            None => {
                debug!(
                    prompt_id = response.prompt_id(),
                    "No backend waiting for response"
                );
                false
            }
        }
    }

    /// Resolve every outstanding request with its default and drop queued
    /// request events that can no longer be answered.
    fn release_waiters(&self) {
        let waiters: Vec<(String, Waiter)> = self.waiters().drain().collect();
        for (prompt_id, waiter) in waiters {
            debug!(prompt_id, "Releasing backend request with default response");
            let _ = waiter
                .tx
                .send(UserResponse::default_for(waiter.kind, prompt_id));
        }
        self.queue().retain(|event| !event.is_request());
    }
}

/// Keeps the bus marked as consumed; detaches on drop.
#[must_use = "the consumer detaches as soon as the guard is dropped"]
pub struct ConsumerGuard {
    bus: EventBus,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.bus
            .inner
            .consumer_attached
            .store(false, Ordering::Release);
        self.bus.release_waiters();
        debug!("Event consumer detached");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn confirm(id: &str) -> AgentEvent {
        AgentEvent::ConfirmationRequest {
            prompt_id: id.into(),
            prompt: "ok?".into(),
            default: true,
            allow_feedback: false,
        }
    }

    #[tokio::test]
    async fn next_wakes_on_publish() {
        let bus = EventBus::default();
        let consumer = bus.clone();
        let handle = tokio::spawn(async move { consumer.next().await });
        tokio::task::yield_now().await;
        bus.publish(AgentEvent::info("hello"));
        let event = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, AgentEvent::info("hello"));
    }

    #[test]
    fn detached_backlog_is_bounded() {
        let bus = EventBus::new(2);
        for i in 0..4 {
            bus.publish(AgentEvent::info(i.to_string()));
        }
        assert_eq!(bus.len(), 2);
        assert_eq!(bus.try_next(), Some(AgentEvent::info("2")));
    }

    #[test]
    fn attached_queue_is_unbounded() {
        let bus = EventBus::new(2);
        let _guard = bus.attach();
        for i in 0..4 {
            bus.publish(AgentEvent::info(i.to_string()));
        }
        assert_eq!(bus.len(), 4);
    }

    #[tokio::test]
    async fn request_without_consumer_returns_default() {
        let bus = EventBus::default();
        let response = bus.request(confirm("1")).await;
        assert_eq!(
            response,
            Some(UserResponse::ConfirmationResponse {
                prompt_id: "1".into(),
                confirmed: false,
                feedback: None,
            })
        );
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn request_resolves_through_provide_response() {
        let bus = EventBus::default();
        let _guard = bus.attach();
        let backend = bus.clone();
        let waiting = tokio::spawn(async move { backend.request(confirm("7")).await });

        let event = bus.next().await;
        assert_eq!(event.interaction(), Some(("7", InteractionKind::Confirm)));
        assert!(bus.provide_response(UserResponse::ConfirmationResponse {
            prompt_id: "7".into(),
            confirmed: true,
            feedback: None,
        }));

        let Some(UserResponse::ConfirmationResponse { confirmed, .. }) = waiting.await.unwrap()
        else {
            panic!("expected confirmation response");
        };
        assert!(confirmed);
    }

    #[tokio::test]
    async fn detaching_releases_blocked_backend() {
        let bus = EventBus::default();
        let guard = bus.attach();
        let backend = bus.clone();
        let waiting = tokio::spawn(async move { backend.request(confirm("9")).await });
        while bus.is_empty() {
            tokio::task::yield_now().await;
        }

        drop(guard);
        let response = waiting.await.unwrap().unwrap();
        assert_eq!(response, UserResponse::default_for(InteractionKind::Confirm, "9"));
        assert!(bus.is_empty(), "stale request event must not linger");
    }

    #[test]
    fn provide_response_without_waiter_is_noop() {
        let bus = EventBus::default();
        assert!(!bus.provide_response(UserResponse::default_for(InteractionKind::Input, "x")));
    }
}
