//! Agent assembly.
//!
//! Wires the connector, dispatcher, and worker manager together over a bus
//! connection and runs until the root cancellation signal fires.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::Bus;
use crate::codec::{self, Content};
use crate::config::Config;
use crate::connector::{Connector, ConnectorConfig};
use crate::dispatch::Dispatcher;
use crate::executor::Executor;
use crate::subject;
use crate::worker::WorkerManager;

/// Run the agent until `cancel` fires, then tear down every worker.
pub async fn run(
    config: &Config,
    bus: Arc<dyn Bus>,
    executor: Arc<dyn Executor>,
    cancel: CancellationToken,
) -> Result<()> {
    let manager = Arc::new(WorkerManager::new(
        config.agent_id.clone(),
        Arc::clone(&bus),
        executor,
        config.chunk_size,
        cancel.clone(),
    ));

    let (connector, queue_rx) = Connector::start(
        &config.agent_id,
        Arc::clone(&bus),
        ConnectorConfig {
            queue_depth: config.dispatch_queue_depth,
            max_inflight: config.max_inflight_requests,
        },
        cancel.clone(),
    )
    .await?;

    let dispatcher = Dispatcher::new(Arc::clone(&manager), connector.control_subject.clone());
    let dispatch_task = tokio::spawn(dispatcher.run(queue_rx, cancel.clone()));

    announce(&bus, &config.agent_id).await;
    info!(agent = %config.agent_id, subject = %connector.control_subject, "Agent serving");

    cancel.cancelled().await;
    info!("Shutting down");

    manager.shutdown().await;
    connector.join().await;
    let _ = dispatch_task.await;
    Ok(())
}

/// Publish the agent's client-info update. Failure is logged, not fatal:
/// the controller can also discover the agent through its replies.
async fn announce(bus: &Arc<dyn Bus>, agent_id: &str) {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let frame = codec::encode_content(&Content::UpdateClientInfo {
        agent_id: agent_id.to_string(),
        hostname,
    });
    match frame {
        Ok(bytes) => {
            let info_subject = subject::client_update_info(agent_id);
            if let Err(e) = bus.publish(&info_subject, bytes.into()).await {
                warn!(error = %e, "Client info publish failed");
            }
        }
        Err(e) => warn!(error = %e, "Client info encode failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::codec::{Action, Response};
    use crate::executor::ProcessExecutor;
    use bytes::Bytes;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            agent_id: "agent1".to_string(),
            chunk_size: 64,
            ..Config::default()
        }
    }

    /// End to end over the in-process bus: create a real worker, watch its
    /// stdout frames and status arrive, then collect the exit code.
    #[tokio::test]
    async fn create_stream_and_execute_roundtrip() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();
        let config = test_config();

        let agent_bus: Arc<dyn Bus> = Arc::new(bus.connection());
        let control = subject::message_reply(&config.agent_id, &agent_bus.instance_id());
        let mut info_rx = bus
            .subscribe(&subject::client_update_info("agent1"))
            .await
            .unwrap();
        let mut stdout_rx = bus
            .subscribe(&subject::worker_write_stdout("agent1", "w00000001"))
            .await
            .unwrap();

        let agent = {
            let config = config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run(&config, agent_bus, Arc::new(ProcessExecutor::new()), cancel).await
            })
        };

        // Startup announcement.
        let info = tokio::time::timeout(Duration::from_secs(5), info_rx.recv())
            .await
            .expect("no client info")
            .unwrap();
        match codec::decode_content(&info.payload).unwrap() {
            Content::UpdateClientInfo { agent_id, .. } => assert_eq!(agent_id, "agent1"),
            other => panic!("unexpected content: {other:?}"),
        }

        // Create a short-lived worker.
        let create = codec::encode_action(&Action::CreateWorker {
            file: "/bin/sh".to_string(),
            args: Some(vec!["-c".to_string(), "printf streamed".to_string()]),
            env: None,
        })
        .unwrap();
        let reply = bus.request(&control, create.into()).await.unwrap().unwrap();
        let worker_id = match codec::decode_response(&reply).unwrap() {
            Response::CreateWorker { worker_id, error } => {
                assert!(error.is_none());
                worker_id
            }
            other => panic!("unexpected response: {other:?}"),
        };
        assert_eq!(worker_id, "w00000001");

        // Stdout streams through the worker's subject.
        let chunk = tokio::time::timeout(Duration::from_secs(5), stdout_rx.recv())
            .await
            .expect("no stdout frame")
            .unwrap();
        match codec::decode_content(&chunk.payload).unwrap() {
            Content::UpdateWorkerStdio { payload, .. } => assert_eq!(payload, b"streamed"),
            other => panic!("unexpected content: {other:?}"),
        }

        // Execute waits out the worker and reports its exit code.
        let execute = codec::encode_action(&Action::Execute {
            worker_id: worker_id.clone(),
        })
        .unwrap();
        let reply = bus.request(&control, execute.into()).await.unwrap().unwrap();
        match codec::decode_response(&reply).unwrap() {
            Response::Execute {
                exit_code, error, ..
            } => {
                assert_eq!(exit_code, 0);
                assert!(error.is_none());
            }
            other => panic!("unexpected response: {other:?}"),
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), agent)
            .await
            .expect("agent did not shut down")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn corrupt_request_gets_an_error_reply() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();
        let config = test_config();

        let agent_bus: Arc<dyn Bus> = Arc::new(bus.connection());
        let control = subject::message_reply(&config.agent_id, &agent_bus.instance_id());

        let agent = {
            let config = config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run(&config, agent_bus, Arc::new(ProcessExecutor::new()), cancel).await
            })
        };

        // Give the endpoint a moment to register.
        let mut reply = None;
        for _ in 0..50 {
            match bus.request(&control, Bytes::from_static(b"garbage")).await {
                Ok(r) => {
                    reply = Some(r);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }

        let err = reply.expect("endpoint never came up").unwrap_err();
        assert_eq!(err.code, crate::dispatch::ERR_INVALID_MESSAGE);

        cancel.cancel();
        agent.await.unwrap().unwrap();
    }
}
