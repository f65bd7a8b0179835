//! Bus capability contract.
//!
//! The agent treats the messaging fabric as an external collaborator: a
//! request/reply and publish/subscribe primitive with at-least-once
//! delivery. Implementations handle transport-specific details while the
//! connector and pipeline work with this uniform interface. The in-process
//! [`memory::MemoryBus`] backs tests and the binary's loopback mode.

pub mod memory;

pub use memory::MemoryBus;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error contract surfaced to RPC callers: a numeric code plus a
/// human-readable description.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("service error {code}: {description}")]
pub struct ServiceError {
    pub code: u16,
    pub description: String,
}

impl ServiceError {
    pub fn new(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// An inbound request on a registered endpoint.
///
/// The reply handle is consumed on use, so at most one reply can ever be
/// sent for a request.
#[derive(Debug)]
pub struct BusRequest {
    pub subject: String,
    pub payload: Bytes,
    pub reply: ReplyHandle,
}

/// Single-use reply channel for one request/response pair.
#[derive(Debug)]
pub struct ReplyHandle {
    tx: oneshot::Sender<Result<Bytes, ServiceError>>,
}

impl ReplyHandle {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Result<Bytes, ServiceError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Reply with a successful payload. A dropped caller is not an error.
    pub fn send_ok(self, payload: Bytes) {
        if self.tx.send(Ok(payload)).is_err() {
            debug!("reply dropped: requester went away");
        }
    }

    /// Reply with a code+description error.
    pub fn send_err(self, code: u16, description: impl Into<String>) {
        if self.tx.send(Err(ServiceError::new(code, description))).is_err() {
            debug!("error reply dropped: requester went away");
        }
    }
}

/// Publish/subscribe + request/reply messaging fabric.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Identifier the bus assigned to this connection. Embedded into the
    /// endpoint subject so concurrent agent processes never collide.
    fn instance_id(&self) -> String;

    /// Fire-and-forget publish to a subject.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to a subject; messages arrive on the returned channel.
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>>;

    /// Register the exclusive request/reply endpoint for a subject.
    ///
    /// A transport must deliver more than the exact subject here: requests
    /// addressed to the agent's other subjects (per-worker stdin traffic in
    /// particular) land on this same queue, and the dispatcher classifies
    /// them by their originating subject. The in-process bus routes by
    /// exact subject only, so its stdin path is exercised at the
    /// dispatcher level rather than end to end.
    async fn register_endpoint(&self, subject: &str) -> Result<mpsc::Receiver<BusRequest>>;

    /// Send a request to an endpoint and await its reply.
    async fn request(&self, subject: &str, payload: Bytes)
        -> Result<Result<Bytes, ServiceError>>;
}

/// Poll `connect` at a fixed interval until it succeeds or `cancel` fires.
///
/// The interval does not grow; deterministic timing matters more here than
/// politeness, since this only runs before the agent is serving.
pub async fn connect_with_retry<B, F, Fut>(
    mut connect: F,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<B>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<B>>,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => match connect().await {
                Ok(bus) => return Ok(bus),
                Err(e) => warn!(error = %e, "Bus connect failed, retrying"),
            },
            () = cancel.cancelled() => {
                anyhow::bail!("cancelled before bus connection was established");
            }
        }
    }
}
