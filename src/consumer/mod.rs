// src/consumer/mod.rs
//! RPC consumer: turns one broker queue into a request handler.
//!
//! # Dispatch loop
//!
//! For every delivery, in broker order and one at a time (prefetch 1):
//!
//! 1. decode the body as JSON,
//! 2. run the processor,
//! 3. publish the reply to `reply_to` with the request's `correlation_id`,
//! 4. acknowledge the delivery.
//!
//! The acknowledgement happens only after the reply is out. If publishing
//! the reply fails, the delivery is rejected with requeue and the broker
//! hands it out again. A processor that mutates state can therefore run
//! twice for one request; there is no deduplication.
//!
//! Undecodable bodies and processor panics are answered with an error reply
//! and acknowledged, so one bad request never stops the loop. Requests
//! without `reply_to` are one-way commands: processed, acknowledged, no
//! reply.
//!
//! # Lifecycle
//!
//! `Created → Connected → Consuming → Stopped`. [`ConsumerHandle::shutdown`]
//! stops intake, lets the message in progress finish, then closes the
//! connection; unacked deliveries go back to the queue.

mod lookup;
mod processor;
mod registry;

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub use lookup::BulkLookup;
pub use processor::{decode_payload, processor_fn, FieldError, ProcessError, Processor, ProcessorPtr, Reply, TypedProcessor};
pub use registry::ProcessorRegistry;

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    Address,
    ConnectorPtr,
    ConsumeOptions,
    Delivery,
    Envelope,
    Result,
    RpcError,
    Transport,
    TransportPtr,
};

/// Where a consumer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Constructed, not yet connected.
    Created,
    /// Connection open, queue declared, prefetch set.
    Connected,
    /// Dispatch loop running.
    Consuming,
    /// Loop ended and connection closed.
    Stopped,
}

/// A consumer bound to one queue and one processor.
pub struct RpcConsumer {
    // ---
    connector: ConnectorPtr,
    queue: Address,
    processor: ProcessorPtr,
    connection_name: String,
    state_tx: watch::Sender<ConsumerState>,
}

impl RpcConsumer {
    /// Consumer serving `queue` with `processor`.
    pub fn new(connector: ConnectorPtr, queue: impl Into<Address>, processor: ProcessorPtr) -> Self {
        // ---
        let queue = queue.into();
        let (state_tx, _) = watch::channel(ConsumerState::Created);

        Self {
            connection_name: format!("consumer:{queue}"),
            connector,
            queue,
            processor,
            state_tx,
        }
    }

    /// Override the connection name used in logs.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    /// Queue this consumer serves.
    pub fn queue(&self) -> &Address {
        &self.queue
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        *self.state_tx.borrow()
    }

    /// Connect, bind the queue and spawn the dispatch loop.
    ///
    /// # Errors
    ///
    /// `RpcError::Connection` if the broker is unreachable, or a transport
    /// error if the queue cannot be declared or consumed. Nothing is left
    /// running in either case.
    pub async fn start(self) -> Result<ConsumerHandle> {
        // ---
        let transport = self.connector.connect(&self.connection_name).await?;

        let inbox = match Self::bind(transport.as_ref(), &self.queue).await {
            Ok(inbox) => inbox,
            Err(err) => {
                let _ = transport.close().await;
                return Err(err);
            }
        };

        self.state_tx.send_replace(ConsumerState::Connected);
        log_info!("{}: bound to queue {}", self.connection_name, self.queue);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state_rx = self.state_tx.subscribe();
        let queue = self.queue.clone();

        let dispatch = DispatchLoop {
            transport,
            queue: self.queue,
            processor: self.processor,
            state_tx: self.state_tx,
        };
        let task = tokio::spawn(dispatch.run(inbox, shutdown_rx));

        Ok(ConsumerHandle {
            queue,
            state_rx,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    async fn bind(transport: &dyn Transport, queue: &Address) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        transport.declare_queue(queue).await?;
        let handle = transport.consume(queue, ConsumeOptions::work_queue()).await?;
        Ok(handle.inbox)
    }
}

/// Control handle of a running consumer.
///
/// Dropping the handle stops the consumer the same way [`shutdown`](Self::shutdown)
/// does, without waiting for it.
pub struct ConsumerHandle {
    // ---
    queue: Address,
    state_rx: watch::Receiver<ConsumerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Queue being served.
    pub fn queue(&self) -> &Address {
        &self.queue
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        *self.state_rx.borrow()
    }

    /// Whether the dispatch loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConsumerState> {
        self.state_rx.clone()
    }

    /// Stop intake, finish the message in progress and close the connection.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the dispatch task panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        // ---
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.join().await
    }

    /// Wait for the dispatch loop to end on its own (connection lost).
    pub async fn join(mut self) -> Result<()> {
        (&mut self.task)
            .await
            .map_err(|e| RpcError::Transport(format!("consumer task for {} failed: {e}", self.queue)))
    }
}

/// State owned by the spawned dispatch task.
struct DispatchLoop {
    // ---
    transport: TransportPtr,
    queue: Address,
    processor: ProcessorPtr,
    state_tx: watch::Sender<ConsumerState>,
}

impl DispatchLoop {
    async fn run(self, mut inbox: mpsc::UnboundedReceiver<Delivery>, mut shutdown_rx: oneshot::Receiver<()>) {
        // ---
        self.state_tx.send_replace(ConsumerState::Consuming);
        log_debug!("{}: dispatch loop started", self.queue);

        loop {
            let delivery = tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    log_info!("{}: shutdown requested", self.queue);
                    break;
                }
                next = inbox.recv() => match next {
                    Some(delivery) => delivery,
                    None => {
                        log_warn!("{}: delivery stream ended", self.queue);
                        break;
                    }
                },
            };

            self.handle(delivery).await;
        }

        drop(inbox);
        if let Err(e) = self.transport.close().await {
            log_warn!("{}: closing connection failed: {e}", self.queue);
        }

        self.state_tx.send_replace(ConsumerState::Stopped);
        log_info!("{}: consumer stopped", self.queue);
    }

    async fn handle(&self, delivery: Delivery) {
        // ---
        let reply_to = delivery.envelope.reply_to.clone();
        let correlation_id = delivery.envelope.correlation_id.clone();

        let reply = match serde_json::from_slice::<Value>(&delivery.envelope.body) {
            Ok(payload) => self.run_processor(payload).await,
            Err(e) => {
                log_warn!("{}: undecodable request body: {e}", self.queue);
                ProcessError::business(format!("invalid JSON payload: {e}")).into()
            }
        };

        let Some(reply_to) = reply_to else {
            log_debug!("{}: one-way command processed", self.queue);
            if let Err(e) = delivery.ack().await {
                log_error!("{}: ack failed: {e}", self.queue);
            }
            return;
        };

        let env = Envelope::reply(reply_to, reply.into_body(), correlation_id);

        match self.transport.publish(env).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    log_error!("{}: ack failed: {e}", self.queue);
                }
            }
            Err(e) => {
                log_error!("{}: publishing reply failed, requeueing request: {e}", self.queue);
                if let Err(e) = delivery.nack(true).await {
                    log_error!("{}: nack failed: {e}", self.queue);
                }
            }
        }
    }

    async fn run_processor(&self, payload: Value) -> Reply {
        // ---
        match AssertUnwindSafe(self.processor.process(payload)).catch_unwind().await {
            Ok(reply) => reply,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                log_error!("{}: processor panicked: {msg}", self.queue);
                ProcessError::business(format!("internal error: {msg}")).into()
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
