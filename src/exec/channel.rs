//! Boundary channels: moving items across graph and machine boundaries.
//!
//! Every storage that crosses a boundary (overall input/output, or an edge
//! between groups on different machines) is served by a channel pair: a
//! [`BoundaryOutputChannel`] pumping the producer-side ring onto a
//! transport, and a [`BoundaryInputChannel`] pumping the transport into the
//! consumer-side ring. The transport itself is the opaque [`Channel`]
//! trait; [`FlumeChannel`] is the provided in-memory implementation.
//!
//! The wire protocol is [`Frame`]s: items, plus an out-of-band
//! [`Frame::Drain`] soft-close marker that propagates the drain from the
//! producer side to the consumer side. Send failures retry with bounded
//! backoff before escalating.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffers::BufferError;
use crate::events::{EventEmitter, ExecEvent};
use crate::exec::work_unit::{BufferHandle, DrainKind};
use crate::types::{Item, Token};

/// Send attempts before a channel failure escalates.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Base backoff between send attempts (scaled linearly by attempt number).
const SEND_BACKOFF: Duration = Duration::from_millis(10);

/// How long a pumping loop waits on its control channel between flushes.
const PUMP_WAIT: Duration = Duration::from_millis(1);

/// Push attempts into a full consumer ring before an item is set aside as
/// drain leftover.
const MAX_PUSH_ATTEMPTS: u32 = 500;

/// Failure on a boundary channel.
#[derive(Debug, Error, Diagnostic)]
pub enum ChannelError {
    #[error("channel for token {token} closed unexpectedly")]
    #[diagnostic(code(streamfuse::channel::closed))]
    Closed { token: Token },

    #[error("channel for token {token} gave up after {attempts} send attempts")]
    #[diagnostic(
        code(streamfuse::channel::exhausted),
        help("the peer is unreachable; the coordinator escalates this to a drain")
    )]
    Exhausted { token: Token, attempts: u32 },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Buffer(#[from] BufferError),
}

/// One unit on the boundary wire: an item, or the drain soft-close marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Item(Item),
    /// Soft close: no more items will follow; drain downstream with the
    /// given disposition.
    Drain(DrainKind),
}

/// The opaque transport seam. Real deployments implement this over their
/// network layer; [`FlumeChannel`] covers in-process execution and tests.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), ChannelError>;
    async fn receive(&mut self) -> Result<Frame, ChannelError>;
    /// Release the transport. Subsequent sends/receives fail with
    /// [`ChannelError::Closed`].
    fn close(&mut self);
}

/// In-memory transport over an unbounded flume channel.
pub struct FlumeChannel {
    token: Token,
    sender: Option<flume::Sender<Frame>>,
    receiver: Option<flume::Receiver<Frame>>,
}

impl FlumeChannel {
    /// A connected (send end, receive end) pair for one token.
    #[must_use]
    pub fn pair(token: Token) -> (FlumeChannel, FlumeChannel) {
        let (tx, rx) = flume::unbounded();
        (
            FlumeChannel {
                token,
                sender: Some(tx),
                receiver: None,
            },
            FlumeChannel {
                token,
                sender: None,
                receiver: Some(rx),
            },
        )
    }
}

#[async_trait]
impl Channel for FlumeChannel {
    async fn send(&mut self, frame: Frame) -> Result<(), ChannelError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or(ChannelError::Closed { token: self.token })?;
        sender
            .send_async(frame)
            .await
            .map_err(|_| ChannelError::Closed { token: self.token })
    }

    async fn receive(&mut self) -> Result<Frame, ChannelError> {
        let receiver = self
            .receiver
            .as_ref()
            .ok_or(ChannelError::Closed { token: self.token })?;
        receiver
            .recv_async()
            .await
            .map_err(|_| ChannelError::Closed { token: self.token })
    }

    fn close(&mut self) {
        self.sender = None;
        self.receiver = None;
    }
}

/// Pumps the producer-side ring onto the transport until told to drain.
pub struct BoundaryOutputChannel {
    token: Token,
    buffer: BufferHandle,
    transport: Box<dyn Channel>,
    emitter: EventEmitter,
}

impl BoundaryOutputChannel {
    #[must_use]
    pub fn new(
        token: Token,
        buffer: BufferHandle,
        transport: Box<dyn Channel>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            token,
            buffer,
            transport,
            emitter,
        }
    }

    /// Run the pumping loop on its own task. The loop flushes the ring,
    /// waits briefly on the control channel, and repeats; a [`DrainKind`]
    /// on `stop` flushes once more, sends the drain marker, and exits.
    pub fn spawn(mut self, stop: flume::Receiver<DrainKind>) -> JoinHandle<Result<(), ChannelError>> {
        tokio::spawn(async move {
            loop {
                self.flush().await?;
                match tokio::time::timeout(PUMP_WAIT, stop.recv_async()).await {
                    Ok(Ok(kind)) => {
                        self.flush().await?;
                        self.send_with_retry(Frame::Drain(kind)).await?;
                        self.transport.close();
                        self.emitter
                            .emit(ExecEvent::channel(self.token, "drain marker sent"));
                        return Ok(());
                    }
                    Ok(Err(_)) => {
                        // Control side dropped without a drain; hard close.
                        self.transport.close();
                        return Ok(());
                    }
                    Err(_) => {} // wait elapsed, flush again
                }
            }
        })
    }

    async fn flush(&mut self) -> Result<(), ChannelError> {
        while let Some(item) = self.buffer.pop() {
            self.send_with_retry(Frame::Item(item)).await?;
        }
        Ok(())
    }

    async fn send_with_retry(&mut self, frame: Frame) -> Result<(), ChannelError> {
        let mut attempts = 0;
        loop {
            match self.transport.send(frame.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempts += 1;
                    if attempts >= MAX_SEND_ATTEMPTS {
                        warn!(token = %self.token, attempts, %err, "send attempts exhausted");
                        return Err(ChannelError::Exhausted {
                            token: self.token,
                            attempts,
                        });
                    }
                    debug!(token = %self.token, attempts, %err, "send failed, backing off");
                    tokio::time::sleep(SEND_BACKOFF * attempts).await;
                }
            }
        }
    }
}

/// What an input channel's task returns when it exits.
#[derive(Debug, Default)]
pub struct InputOutcome {
    /// The drain marker received from upstream, if any.
    pub drain: Option<DrainKind>,
    /// Items that arrived but no longer fit the consumer ring at drain
    /// time; they belong in the drain data.
    pub leftover: Vec<Item>,
}

/// Pumps the transport into the consumer-side ring until the drain marker
/// (or a stop signal from the coordinator) arrives.
pub struct BoundaryInputChannel {
    token: Token,
    buffer: BufferHandle,
    transport: Box<dyn Channel>,
    emitter: EventEmitter,
}

impl BoundaryInputChannel {
    #[must_use]
    pub fn new(
        token: Token,
        buffer: BufferHandle,
        transport: Box<dyn Channel>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            token,
            buffer,
            transport,
            emitter,
        }
    }

    pub fn spawn(
        mut self,
        stop: flume::Receiver<DrainKind>,
    ) -> JoinHandle<Result<InputOutcome, ChannelError>> {
        tokio::spawn(async move {
            let mut outcome = InputOutcome::default();
            loop {
                tokio::select! {
                    biased;
                    _ = stop.recv_async() => {
                        // Coordinator-initiated stop: the upstream marker
                        // may never come. Salvage whatever is still queued
                        // on the transport before closing, or those items
                        // vanish from the drain.
                        self.collect_pending(&mut outcome).await;
                        self.transport.close();
                        return Ok(outcome);
                    }
                    frame = self.transport.receive() => match frame {
                        Ok(Frame::Item(item)) => {
                            if let Some(rejected) = self.push_with_wait(item).await? {
                                outcome.leftover.push(rejected);
                            }
                        }
                        Ok(Frame::Drain(kind)) => {
                            self.transport.close();
                            self.emitter.emit(ExecEvent::channel(
                                self.token,
                                "drain marker received",
                            ));
                            outcome.drain = Some(kind);
                            return Ok(outcome);
                        }
                        Err(ChannelError::Closed { .. }) => {
                            // Peer vanished without a marker.
                            warn!(token = %self.token, "transport closed without drain marker");
                            return Ok(outcome);
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        })
    }

    /// Pull everything still queued on the transport into the leftover
    /// list. Runs on a forced stop, where waiting on the marker is no
    /// longer an option; a quiet or closed transport ends the sweep.
    async fn collect_pending(&mut self, outcome: &mut InputOutcome) {
        loop {
            match tokio::time::timeout(PUMP_WAIT, self.transport.receive()).await {
                Ok(Ok(Frame::Item(item))) => outcome.leftover.push(item),
                Ok(Ok(Frame::Drain(kind))) => outcome.drain = Some(kind),
                Ok(Err(_)) | Err(_) => return,
            }
        }
    }

    /// Push into the consumer ring, waiting while it is full. Gives up
    /// after a bounded wait (the consumer has stopped) and hands the item
    /// back for the drain leftover.
    async fn push_with_wait(&mut self, item: Item) -> Result<Option<Item>, ChannelError> {
        for _ in 0..MAX_PUSH_ATTEMPTS {
            match self.buffer.push(item.clone()) {
                Ok(()) => return Ok(None),
                Err(BufferError::Full { .. }) => tokio::time::sleep(PUMP_WAIT).await,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Some(item))
    }
}
