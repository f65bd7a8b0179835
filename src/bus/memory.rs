//! In-process bus over `tokio::sync` primitives.
//!
//! One hub holds the subject → subscriber and subject → endpoint tables;
//! every connection handed out by [`MemoryBus::connection`] shares the hub
//! but carries its own bus-assigned instance identifier. Serves the test
//! suite and the binary's loopback mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use super::{Bus, BusMessage, BusRequest, ReplyHandle, ServiceError};

/// Queue depth for subscriber and endpoint channels.
const CHANNEL_DEPTH: usize = 256;

#[derive(Default)]
struct Hub {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
    endpoints: RwLock<HashMap<String, mpsc::Sender<BusRequest>>>,
    next_instance: AtomicU64,
}

/// One connection to the in-process hub.
#[derive(Clone)]
pub struct MemoryBus {
    hub: Arc<Hub>,
    instance_id: String,
}

impl MemoryBus {
    /// Create a hub and the first connection to it.
    pub fn new() -> Self {
        let hub = Arc::new(Hub::default());
        Self::attach(hub)
    }

    /// A further connection to the same hub, with a fresh instance id.
    pub fn connection(&self) -> Self {
        Self::attach(Arc::clone(&self.hub))
    }

    fn attach(hub: Arc<Hub>) -> Self {
        let n = hub.next_instance.fetch_add(1, Ordering::Relaxed);
        Self {
            hub,
            instance_id: format!("{n:08x}"),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    fn instance_id(&self) -> String {
        self.instance_id.clone()
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let mut subscribers = self.hub.subscribers.write().await;
        let Some(senders) = subscribers.get_mut(subject) else {
            debug!(subject = %subject, "Publish with no subscribers");
            return Ok(());
        };

        // Deliver to every live subscriber; prune closed ones.
        let mut live = Vec::with_capacity(senders.len());
        for tx in senders.drain(..) {
            let msg = BusMessage {
                subject: subject.to_string(),
                payload: payload.clone(),
            };
            if tx.send(msg).await.is_ok() {
                live.push(tx);
            }
        }
        *senders = live;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.hub
            .subscribers
            .write()
            .await
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn register_endpoint(&self, subject: &str) -> Result<mpsc::Receiver<BusRequest>> {
        let mut endpoints = self.hub.endpoints.write().await;
        anyhow::ensure!(
            !endpoints.contains_key(subject),
            "endpoint already registered for subject '{subject}'"
        );
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        endpoints.insert(subject.to_string(), tx);
        Ok(rx)
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> Result<Result<Bytes, ServiceError>> {
        let tx = {
            let endpoints = self.hub.endpoints.read().await;
            endpoints
                .get(subject)
                .cloned()
                .with_context(|| format!("no endpoint for subject '{subject}'"))?
        };

        let (reply, reply_rx) = ReplyHandle::channel();
        tx.send(BusRequest {
            subject: subject.to_string(),
            payload,
            reply,
        })
        .await
        .map_err(|_| anyhow::anyhow!("endpoint for '{subject}' is gone"))?;

        reply_rx
            .await
            .context("endpoint dropped the request without replying")
    }
}
