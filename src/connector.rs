//! Bus-facing RPC endpoint.
//!
//! Registers the agent's single request/reply endpoint, keyed by a subject
//! that embeds the bus-assigned instance identifier so concurrent agent
//! processes never collide. Each accepted request gets its own task and a
//! single-use reply channel; the task parks on that channel or on the root
//! cancellation signal, whichever fires first, so every request produces at
//! most one reply.
//!
//! Admission is bounded on purpose: the dispatch queue has a fixed depth
//! and total in-flight requests are capped by a semaphore, so overload
//! backpressures the bus instead of fanning out without limit.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{Bus, BusRequest};
use crate::dispatch::{WorkItem, ERR_INTERNAL};
use crate::subject;

/// Admission limits for the endpoint.
#[derive(Debug, Clone, Copy)]
pub struct ConnectorConfig {
    /// Depth of the dispatch queue feeding the dispatcher.
    pub queue_depth: usize,
    /// Cap on concurrently in-flight request tasks.
    pub max_inflight: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            max_inflight: 256,
        }
    }
}

/// A running endpoint: the control subject it serves and its accept loop.
pub struct Connector {
    pub control_subject: String,
    accept_loop: JoinHandle<()>,
}

impl Connector {
    /// Register the endpoint and start accepting requests. Work items come
    /// out of the returned queue in arrival order.
    pub async fn start(
        agent_id: &str,
        bus: Arc<dyn Bus>,
        config: ConnectorConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<WorkItem>)> {
        let control_subject = subject::message_reply(agent_id, &bus.instance_id());
        let mut endpoint = bus
            .register_endpoint(&control_subject)
            .await
            .with_context(|| format!("failed to register endpoint '{control_subject}'"))?;

        info!(subject = %control_subject, "Registered control endpoint");

        let (queue_tx, queue_rx) = mpsc::channel::<WorkItem>(config.queue_depth.max(1));
        let inflight = Arc::new(Semaphore::new(config.max_inflight.max(1)));

        let loop_cancel = cancel.clone();
        let accept_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = endpoint.recv() => match maybe {
                        Some(request) => {
                            accept(request, &queue_tx, &inflight, &loop_cancel).await;
                        }
                        None => break,
                    },
                    () = loop_cancel.cancelled() => break,
                }
            }
            debug!("Connector accept loop stopped");
        });

        Ok((
            Self {
                control_subject,
                accept_loop,
            },
            queue_rx,
        ))
    }

    /// Wait for the accept loop to exit.
    pub async fn join(self) {
        let _ = self.accept_loop.await;
    }
}

/// Admit one request: take an in-flight permit, then hand the rest to an
/// independent task so slow dispatch never stalls the accept loop beyond
/// the admission caps.
async fn accept(
    request: BusRequest,
    queue_tx: &mpsc::Sender<WorkItem>,
    inflight: &Arc<Semaphore>,
    cancel: &CancellationToken,
) {
    let permit = match Arc::clone(inflight).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return, // semaphore closed, agent is shutting down
    };

    let queue_tx = queue_tx.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let _permit = permit;
        let (reply_tx, reply_rx) = oneshot::channel();
        let item = WorkItem {
            subject: request.subject,
            payload: request.payload,
            reply: reply_tx,
        };

        // Bounded queue: a full dispatcher backpressures here.
        let enqueued = tokio::select! {
            sent = queue_tx.send(item) => sent.is_ok(),
            () = cancel.cancelled() => false,
        };
        if !enqueued {
            // No reply: the caller observes a bus-level timeout instead.
            return;
        }

        tokio::select! {
            result = reply_rx => match result {
                Ok(Ok(payload)) => request.reply.send_ok(payload),
                Ok(Err(e)) => request.reply.send_err(e.code, e.description),
                Err(_) => request.reply.send_err(
                    ERR_INTERNAL,
                    "request was dropped before a reply was produced",
                ),
            },
            () = cancel.cancelled() => {
                // Exit without sending; at-most-one reply still holds.
                debug!("Request task cancelled before reply");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use bytes::Bytes;
    use std::time::Duration;

    /// Echo dispatcher: replies with the item's own payload.
    fn spawn_echo(mut queue: mpsc::Receiver<WorkItem>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(item) = queue.recv().await {
                let _ = item.reply.send(Ok(item.payload));
            }
        })
    }

    #[tokio::test]
    async fn hundred_concurrent_requests_see_only_their_own_reply() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();
        let (connector, queue_rx) = Connector::start(
            "agent1",
            bus.clone(),
            ConnectorConfig::default(),
            cancel.clone(),
        )
        .await
        .unwrap();
        let echo = spawn_echo(queue_rx);
        let control = connector.control_subject.clone();

        let mut callers = Vec::new();
        for i in 0..100u32 {
            let bus = bus.clone();
            let control = control.clone();
            callers.push(tokio::spawn(async move {
                let payload = Bytes::from(format!("request-{i}"));
                let reply = bus.request(&control, payload.clone()).await.unwrap();
                assert_eq!(reply.unwrap(), payload);
            }));
        }
        for caller in callers {
            tokio::time::timeout(Duration::from_secs(5), caller)
                .await
                .expect("caller starved")
                .unwrap();
        }

        cancel.cancel();
        connector.join().await;
        echo.abort();
    }

    #[tokio::test]
    async fn service_errors_pass_through_verbatim() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();
        let (connector, mut queue_rx) = Connector::start(
            "agent1",
            bus.clone(),
            ConnectorConfig::default(),
            cancel.clone(),
        )
        .await
        .unwrap();
        tokio::spawn(async move {
            let item = queue_rx.recv().await.unwrap();
            let _ = item.reply.send(Err(crate::bus::ServiceError::new(4400, "bad frame")));
        });

        let reply = bus
            .request(&connector.control_subject, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let err = reply.unwrap_err();
        assert_eq!(err.code, 4400);
        assert_eq!(err.description, "bad frame");
    }

    #[tokio::test]
    async fn dropped_work_item_becomes_internal_error() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();
        let (connector, mut queue_rx) = Connector::start(
            "agent1",
            bus.clone(),
            ConnectorConfig::default(),
            cancel.clone(),
        )
        .await
        .unwrap();
        tokio::spawn(async move {
            let item = queue_rx.recv().await.unwrap();
            drop(item); // reply channel dropped without a value
        });

        let reply = bus
            .request(&connector.control_subject, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(reply.unwrap_err().code, ERR_INTERNAL);
    }

    #[tokio::test]
    async fn cancellation_before_reply_releases_the_caller() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();
        let (connector, mut queue_rx) = Connector::start(
            "agent1",
            bus.clone(),
            ConnectorConfig::default(),
            cancel.clone(),
        )
        .await
        .unwrap();

        // Dispatcher that parks items forever without replying.
        let parked = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(item) = queue_rx.recv().await {
                held.push(item);
            }
        });

        let control = connector.control_subject.clone();
        let caller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.request(&control, Bytes::from_static(b"x")).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        // The request task exits without sending; the caller unblocks with
        // a transport-level failure rather than hanging.
        let outcome = tokio::time::timeout(Duration::from_secs(2), caller)
            .await
            .expect("caller blocked past cancellation")
            .unwrap();
        assert!(outcome.is_err());

        connector.join().await;
        parked.abort();
    }

    #[tokio::test]
    async fn endpoint_subjects_differ_per_instance() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();
        let (a, _rx_a) = Connector::start(
            "agent1",
            bus.clone(),
            ConnectorConfig::default(),
            cancel.clone(),
        )
        .await
        .unwrap();
        let other = Arc::new(bus.connection());
        let (b, _rx_b) =
            Connector::start("agent1", other, ConnectorConfig::default(), cancel.clone())
                .await
                .unwrap();

        assert_ne!(a.control_subject, b.control_subject);
    }
}
