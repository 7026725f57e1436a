//! In-process broker.
//!
//! Routes like a small RabbitMQ (direct, fanout, topic; headers exchanges
//! behave like fanout), tracks unacknowledged deliveries per session and
//! requeues them when the session drops. Fault controls let tests refuse
//! connects, drop every connection, nack publishes and delay confirms.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use calendar_core::config::ExchangeType;
use calendar_core::error::{CalendarError, Result};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::transport::{
    Acknowledger, BrokerConnector, BrokerSession, Confirmation, Delivery, DeliveryStream,
    PendingConfirm,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerEntry {
    session: u64,
    tag: String,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct Binding {
    queue: String,
    exchange: String,
    key: String,
}

struct Unacked {
    queue: String,
    body: Vec<u8>,
    session: u64,
}

type Shared = Arc<Mutex<BrokerState>>;

#[derive(Default)]
struct BrokerState {
    connects: u32,
    refuse: u32,
    nack: bool,
    confirm_delay: Duration,
    next_session: u64,
    next_tag: u64,
    sessions: HashMap<u64, watch::Sender<Option<String>>>,
    exchanges: HashMap<String, ExchangeType>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    unacked: HashMap<u64, Unacked>,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn routes(kind: ExchangeType, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeType::Direct => binding_key == routing_key,
        ExchangeType::Fanout | ExchangeType::Headers => true,
        ExchangeType::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|i| topic_matches(rest, &words[i..])),
        Some((&"*", rest)) => !words.is_empty() && topic_matches(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && topic_matches(rest, &words[1..]),
    }
}

impl BrokerState {
    fn alive(&self, session: u64) -> Result<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(CalendarError::ConnectionLost(format!("session {session} is closed")))
        }
    }

    fn route(&mut self, shared: &Weak<Mutex<BrokerState>>, exchange: &str, key: &str, body: &[u8]) -> Result<()> {
        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| CalendarError::broker(format!("NOT_FOUND - no exchange '{exchange}'")))?;
        self.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: key.to_string(),
            body: body.to_vec(),
        });

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && routes(kind, &b.key, key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(Message { body: body.to_vec(), redelivered: false });
            }
            self.dispatch(shared, &name);
        }
        Ok(())
    }

    /// Hand ready messages to consumers round-robin.
    fn dispatch(&mut self, shared: &Weak<Mutex<BrokerState>>, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let idx = queue.next_consumer % queue.consumers.len();
            self.next_tag += 1;
            let tag = self.next_tag;
            let consumer = &queue.consumers[idx];
            let session = consumer.session;
            let acker = MemoryAcker { state: shared.clone(), session, tag };
            let delivery = Delivery::new(tag, message.body.clone(), message.redelivered, acker);

            if consumer.tx.send(Ok(delivery)).is_err() {
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }
            self.unacked.insert(tag, Unacked { queue: name.to_string(), body: message.body, session });
            queue.next_consumer = idx + 1;
        }
    }

    fn requeue(&mut self, tag: u64) -> Option<String> {
        let unacked = self.unacked.remove(&tag)?;
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.ready.push_front(Message { body: unacked.body, redelivered: true });
        }
        Some(unacked.queue)
    }

    fn drop_session(&mut self, shared: &Weak<Mutex<BrokerState>>, id: u64, reason: &str) {
        let Some(closed) = self.sessions.remove(&id) else {
            return;
        };
        closed.send_replace(Some(reason.to_string()));
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.session != id);
        }

        let mut orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.session == id)
            .map(|(tag, _)| *tag)
            .collect();
        // newest first, so the oldest ends up at the head of its queue
        orphaned.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched: Vec<String> = orphaned.into_iter().filter_map(|tag| self.requeue(tag)).collect();
        touched.sort();
        touched.dedup();
        for name in touched {
            self.dispatch(shared, &name);
        }
    }
}

/// Cheap to clone; clones share one broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Shared,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connects(&self, n: u32) {
        lock(&self.state).refuse = n;
    }

    /// Nack every publish on confirm-enabled sessions and drop the message.
    pub fn set_nack(&self, nack: bool) {
        lock(&self.state).nack = nack;
    }

    pub fn set_confirm_delay(&self, delay: Duration) {
        lock(&self.state).confirm_delay = delay;
    }

    /// Close every open session as if the broker restarted. Unacked
    /// deliveries go back to their queues flagged as redelivered.
    pub fn disconnect_all(&self) {
        let weak = Arc::downgrade(&self.state);
        let mut state = lock(&self.state);
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            state.drop_session(&weak, id, "CONNECTION_FORCED - broker forced connection closure");
        }
        tracing::debug!("memory broker dropped all connections");
    }

    /// Successful connects so far.
    pub fn connection_count(&self) -> u32 {
        lock(&self.state).connects
    }

    pub fn open_sessions(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    /// Every message accepted for routing, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked(&self) -> usize {
        lock(&self.state).unacked.len()
    }

    /// Publish from outside any session, e.g. a foreign producer.
    pub fn inject(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let weak = Arc::downgrade(&self.state);
        lock(&self.state).route(&weak, exchange, routing_key, body)
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerSession>> {
        let mut state = lock(&self.state);
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(CalendarError::broker(format!("connection refused: {uri}")));
        }
        state.connects += 1;
        state.next_session += 1;
        let id = state.next_session;
        let (closed_tx, closed_rx) = watch::channel(None);
        state.sessions.insert(id, closed_tx);

        tracing::debug!(session = id, "memory broker accepted connection");
        Ok(Arc::new(MemorySession {
            id,
            state: self.state.clone(),
            closed: closed_rx,
            confirms: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    id: u64,
    state: Shared,
    closed: watch::Receiver<Option<String>>,
    confirms: AtomicBool,
}

impl MemorySession {
    fn live(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = lock(&self.state);
        state.alive(self.id)?;
        Ok(state)
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn enable_confirms(&self) -> Result<()> {
        self.live()?;
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()> {
        let mut state = self.live()?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(CalendarError::broker(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}'"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.live()?.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        let mut state = self.live()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(CalendarError::broker(format!("NOT_FOUND - no exchange '{exchange}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(CalendarError::broker(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.key == binding_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                key: binding_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<PendingConfirm> {
        let weak = Arc::downgrade(&self.state);
        let (nack, delay) = {
            let mut state = self.live()?;
            let confirms = self.confirms.load(Ordering::SeqCst);
            let nack = confirms && state.nack;
            if !nack {
                state.route(&weak, exchange, routing_key, payload)?;
            }
            (nack, state.confirm_delay)
        };

        if !self.confirms.load(Ordering::SeqCst) {
            return Ok(Box::pin(async { Ok(Confirmation::NotRequested) }));
        }
        Ok(Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(if nack { Confirmation::Nack } else { Confirmation::Ack })
        }))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let weak = Arc::downgrade(&self.state);
        let mut state = self.live()?;
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| CalendarError::broker(format!("NOT_FOUND - no queue '{queue}'")))?;
        if entry.consumers.iter().any(|c| c.session == self.id && c.tag == consumer_tag) {
            return Err(CalendarError::broker(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        entry.consumers.push(ConsumerEntry { session: self.id, tag: consumer_tag.to_string(), tx });
        state.dispatch(&weak, queue);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.live()?;
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| !(c.session == self.id && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "broker dropped".to_string(),
        }
    }

    async fn close(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.state);
        lock(&self.state).drop_session(&weak, self.id, "closed by client");
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    session: u64,
    tag: u64,
}

impl MemoryAcker {
    fn shared(&self) -> Result<Shared> {
        self.state.upgrade().ok_or_else(|| CalendarError::ConnectionLost("broker dropped".into()))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let shared = self.shared()?;
        let mut state = lock(&shared);
        state.alive(self.session)?;
        state
            .unacked
            .remove(&self.tag)
            .map(|_| ())
            .ok_or_else(|| CalendarError::broker(format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let shared = self.shared()?;
        let mut state = lock(&shared);
        state.alive(self.session)?;
        if requeue {
            let queue = state.requeue(self.tag).ok_or_else(|| {
                CalendarError::broker(format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag))
            })?;
            state.dispatch(&self.state, &queue);
        } else {
            state.unacked.remove(&self.tag);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(broker: &MemoryBroker) -> Arc<dyn BrokerSession> {
        broker.connect("memory://").await.unwrap()
    }

    #[test]
    fn test_topic_patterns() {
        let m = |p: &str, k: &str| routes(ExchangeType::Topic, p, k);
        assert!(m("calendar.*", "calendar.notification"));
        assert!(!m("calendar.*", "calendar.notification.sms"));
        assert!(m("calendar.#", "calendar"));
        assert!(m("calendar.#", "calendar.notification.sms"));
        assert!(m("#.sms", "calendar.notification.sms"));
        assert!(!m("*.sms", "calendar.notification.sms"));
        assert!(routes(ExchangeType::Direct, "notification", "notification"));
        assert!(!routes(ExchangeType::Direct, "notification", "other"));
        assert!(routes(ExchangeType::Fanout, "", "anything"));
    }

    #[tokio::test]
    async fn test_routes_to_bound_queue_and_acks() {
        let broker = MemoryBroker::new();
        let s = session(&broker).await;
        s.declare_exchange("calendar", ExchangeType::Direct).await.unwrap();
        s.declare_queue("notifications").await.unwrap();
        s.bind_queue("notifications", "calendar", "notification").await.unwrap();

        s.publish("calendar", "notification", b"one").await.unwrap().await.unwrap();
        s.publish("calendar", "elsewhere", b"two").await.unwrap().await.unwrap();
        assert_eq!(broker.queue_depth("notifications"), 1);
        assert_eq!(broker.published().len(), 2);

        let mut stream = s.consume("notifications", "tag").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"one");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked(), 1);
        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_requeues_unacked() {
        let broker = MemoryBroker::new();
        let s = session(&broker).await;
        s.declare_exchange("calendar", ExchangeType::Fanout).await.unwrap();
        s.declare_queue("q").await.unwrap();
        s.bind_queue("q", "calendar", "").await.unwrap();
        let mut stream = s.consume("q", "tag").await.unwrap();
        broker.inject("calendar", "", b"payload").unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        broker.disconnect_all();
        assert!(stream.next().await.is_none(), "stream ends with the session");
        assert!(matches!(delivery.ack().await, Err(CalendarError::ConnectionLost(_))));
        assert_eq!(s.closed().await, "CONNECTION_FORCED - broker forced connection closure");
        assert_eq!(broker.queue_depth("q"), 1);

        let s2 = session(&broker).await;
        let mut stream = s2.consume("q", "tag").await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.body, b"payload");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_nack_mode_drops_message() {
        let broker = MemoryBroker::new();
        let s = session(&broker).await;
        s.enable_confirms().await.unwrap();
        s.declare_exchange("calendar", ExchangeType::Direct).await.unwrap();
        broker.set_nack(true);
        let confirm = s.publish("calendar", "k", b"x").await.unwrap().await.unwrap();
        assert_eq!(confirm, Confirmation::Nack);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_refused_connects_and_closed_session() {
        let broker = MemoryBroker::new();
        broker.refuse_connects(2);
        assert!(broker.connect("memory://").await.is_err());
        assert!(broker.connect("memory://").await.is_err());
        let s = session(&broker).await;
        assert_eq!(broker.connection_count(), 1);

        s.close().await.unwrap();
        assert_eq!(broker.open_sessions(), 0);
        assert!(matches!(
            s.declare_queue("q").await,
            Err(CalendarError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_exchange_type_mismatch() {
        let broker = MemoryBroker::new();
        let s = session(&broker).await;
        s.declare_exchange("calendar", ExchangeType::Direct).await.unwrap();
        assert!(s.declare_exchange("calendar", ExchangeType::Topic).await.is_err());
    }
}
