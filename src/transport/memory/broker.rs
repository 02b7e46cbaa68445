// src/transport/memory/broker.rs

//! In-process broker state.
//!
//! All queues, consumers and unacknowledged deliveries live behind one
//! mutex. Every operation is short and non-blocking, so the lock is a plain
//! `std::sync::Mutex` and deliveries are pushed into unbounded channels while
//! it is held; the prefetch window is what bounds a consumer's backlog.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    Acknowledger,
    ConsumeOptions,
    Delivery,
    Envelope,
    Result,
    RpcError,
    SubscriptionHandle,
};

/// Shared in-process message broker.
///
/// Every [`MemoryConnector`](super::MemoryConnector) built on the same
/// broker talks to the same queues, exactly as services connected to one
/// RabbitMQ node would. Tests build a fresh broker each for isolation.
///
/// The broker can be switched offline with [`set_available`](Self::set_available)
/// to simulate an unreachable host: new connections, publishes, declares and
/// consumes fail with `RpcError::Connection` until it is switched back.
pub struct MemoryBroker {
    // ---
    self_ref: Weak<MemoryBroker>,
    state: Mutex<BrokerState>,
    available: AtomicBool,
    next_id: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<Arc<str>, Queue>,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Envelope>,
    consumers: Vec<ConsumerSlot>,
    exclusive_owner: Option<u64>,
    cursor: usize,
}

struct ConsumerSlot {
    tag: u64,
    connection: u64,
    opts: ConsumeOptions,
    tx: mpsc::UnboundedSender<Delivery>,
    unacked: HashMap<u64, Envelope>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        match self.opts.prefetch {
            Some(limit) => self.unacked.len() < usize::from(limit),
            None => true,
        }
    }

    /// Unacked envelopes in delivery order.
    fn drain_unacked(&mut self) -> Vec<Envelope> {
        let mut pending: Vec<(u64, Envelope)> = self.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);
        pending.into_iter().map(|(_, env)| env).collect()
    }
}

impl Queue {
    /// Round-robin over consumers that still have room in their window.
    fn pick_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        (0..count)
            .map(|offset| (self.cursor + offset) % count)
            .find(|&index| self.consumers[index].has_capacity())
            .map(|index| {
                self.cursor = index + 1;
                index
            })
    }

    fn requeue_front(&mut self, envelopes: Vec<Envelope>) {
        for env in envelopes.into_iter().rev() {
            self.ready.push_front(env);
        }
    }
}

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            state: Mutex::new(BrokerState::default()),
            available: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        })
    }

    /// Bring the broker online or take it offline.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the broker currently accepts operations.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Whether a queue with this name exists.
    pub fn queue_exists(&self, queue: &str) -> bool {
        lock_ignore_poison(&self.state).queues.contains_key(queue)
    }

    /// Number of messages waiting in `queue`, not counting unacked ones.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Number of delivered but unacknowledged messages of `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.iter().map(|c| c.unacked.len()).sum())
    }

    /// Number of consumers attached to `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RpcError::Connection("memory broker is unavailable".into()))
        }
    }

    pub(super) fn open_connection(&self) -> Result<u64> {
        self.ensure_available()?;
        Ok(self.next_id())
    }

    pub(super) fn declare_queue(&self, connection: u64, name: &str, exclusive: bool) -> Result<()> {
        // ---
        self.ensure_available()?;

        let mut state = lock_ignore_poison(&self.state);
        let queue = state.queues.entry(Arc::from(name)).or_insert_with(|| Queue {
            exclusive_owner: exclusive.then_some(connection),
            ..Queue::default()
        });

        match queue.exclusive_owner {
            Some(owner) if owner != connection => Err(RpcError::Transport(format!(
                "queue '{name}' is exclusive to another connection"
            ))),
            _ => Ok(()),
        }
    }

    pub(super) fn declare_server_named(&self, connection: u64) -> Result<Arc<str>> {
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        self.declare_queue(connection, &name, true)?;
        Ok(Arc::from(name))
    }

    pub(super) fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        self.ensure_available()?;

        let mut state = lock_ignore_poison(&self.state);
        let name = env.routing_key.0.clone();

        match state.queues.get_mut(&name) {
            Some(queue) => {
                queue.ready.push_back(env);
                self.dispatch(&name, queue);
            }
            None => {
                // Default exchange drops unroutable messages.
                log_debug!("memory broker: no queue '{name}', message dropped");
            }
        }

        Ok(())
    }

    pub(super) fn consume(
        &self,
        connection: u64,
        name: &str,
        opts: ConsumeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        self.ensure_available()?;

        let mut state = lock_ignore_poison(&self.state);
        let queue = state
            .queues
            .get_mut(name)
            .ok_or_else(|| RpcError::Transport(format!("queue '{name}' not found")))?;

        if matches!(queue.exclusive_owner, Some(owner) if owner != connection) {
            return Err(RpcError::Transport(format!(
                "queue '{name}' is exclusive to another connection"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue.consumers.push(ConsumerSlot {
            tag: self.next_id(),
            connection,
            opts,
            tx,
            unacked: HashMap::new(),
        });

        self.dispatch(&Arc::from(name), queue);

        Ok(SubscriptionHandle { inbox: rx })
    }

    pub(super) fn close_connection(&self, connection: u64) {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        state
            .queues
            .retain(|_, queue| queue.exclusive_owner != Some(connection));

        for (name, queue) in state.queues.iter_mut() {
            let mut returned = Vec::new();
            queue.consumers.retain_mut(|consumer| {
                if consumer.connection == connection {
                    returned.extend(consumer.drain_unacked());
                    false
                } else {
                    true
                }
            });

            if !returned.is_empty() {
                log_debug!("memory broker: requeued {} unacked message(s) on '{name}'", returned.len());
                queue.requeue_front(returned);
            }

            self.dispatch(name, queue);
        }
    }

    fn settle(&self, queue: &str, consumer_tag: u64, delivery_tag: u64, requeue: Option<bool>) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let name: Arc<str> = Arc::from(queue);
        let queue = state
            .queues
            .get_mut(&name)
            .ok_or_else(|| RpcError::Transport(format!("queue '{name}' no longer exists")))?;

        let envelope = queue
            .consumers
            .iter_mut()
            .find(|c| c.tag == consumer_tag)
            .and_then(|c| c.unacked.remove(&delivery_tag))
            .ok_or_else(|| RpcError::Transport(format!("unknown delivery tag {delivery_tag}")))?;

        if requeue == Some(true) {
            queue.ready.push_front(envelope);
        }

        self.dispatch(&name, queue);
        Ok(())
    }

    /// Hand ready messages to consumers with room in their prefetch window.
    fn dispatch(&self, name: &Arc<str>, queue: &mut Queue) {
        // ---
        while !queue.ready.is_empty() {
            let Some(index) = queue.pick_consumer() else {
                break;
            };
            let Some(envelope) = queue.ready.pop_front() else {
                break;
            };

            let delivery_tag = self.next_id();
            let consumer = &mut queue.consumers[index];

            let delivery = if consumer.opts.auto_ack {
                Delivery::auto_acked(envelope.clone())
            } else {
                Delivery::new(
                    envelope.clone(),
                    Box::new(MemoryAcker {
                        broker: self.self_ref.clone(),
                        queue: name.clone(),
                        consumer_tag: consumer.tag,
                        delivery_tag,
                    }),
                )
            };

            if consumer.tx.send(delivery).is_err() {
                // Inbox dropped; detach the consumer and return its messages.
                let mut gone = queue.consumers.remove(index);
                let mut returned = gone.drain_unacked();
                returned.push(envelope);
                queue.requeue_front(returned);
                continue;
            }

            if !consumer.opts.auto_ack {
                consumer.unacked.insert(delivery_tag, envelope);
            }
        }
    }
}

/// Acknowledgement handle for one memory-broker delivery.
struct MemoryAcker {
    broker: Weak<MemoryBroker>,
    queue: Arc<str>,
    consumer_tag: u64,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn broker(&self) -> Result<Arc<MemoryBroker>> {
        self.broker
            .upgrade()
            .ok_or_else(|| RpcError::Connection("memory broker dropped".into()))
    }
}

#[async_trait::async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker()?
            .settle(&self.queue, self.consumer_tag, self.delivery_tag, None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.broker()?
            .settle(&self.queue, self.consumer_tag, self.delivery_tag, Some(requeue))
    }
}
