//! Work-item classification and control-action dispatch.
//!
//! Each item pulled from the dispatch queue moves through
//! `Received → Classified → {Command | Stdin | Rejected}`; commands finish
//! `Completed-and-Replied`. Classification is by originating subject: an
//! exact match on the agent's control subject means a control frame, any
//! other subject is raw stdin data forwarded byte for byte to the worker
//! named by the subject's trailing token.
//!
//! The control path decodes the legacy Action family first and falls back
//! to the canonical Content family (start/stop requests), so both worker
//! command protocols are served on the same endpoint.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::ServiceError;
use crate::codec::{self, Action, CodecError, Content, Response};
use crate::executor::ProgramSpec;
use crate::subject;
use crate::worker::{WorkerManager, WorkerStatus};

/// Generic internal failure.
pub const ERR_INTERNAL: u16 = 500;
/// The control payload did not decode as any known frame.
pub const ERR_INVALID_MESSAGE: u16 = 4400;
/// The frame decoded but carried no supported action.
pub const ERR_INVALID_ACTION: u16 = 4401;
/// The command produced a result with no wire counterpart.
pub const ERR_INVALID_RESPONSE: u16 = 4402;
/// The reply frame failed to encode.
pub const ERR_ENCODE_FAILED: u16 = 4500;

/// One unit of inbound work: the raw payload, its originating subject, and
/// the single-use reply channel owned by the requesting connector task.
#[derive(Debug)]
pub struct WorkItem {
    pub subject: String,
    pub payload: Bytes,
    pub reply: oneshot::Sender<Result<Bytes, ServiceError>>,
}

/// Routes work items to the worker manager and encodes replies.
pub struct Dispatcher {
    manager: Arc<WorkerManager>,
    control_subject: String,
}

impl Dispatcher {
    pub fn new(manager: Arc<WorkerManager>, control_subject: impl Into<String>) -> Self {
        Self {
            manager,
            control_subject: control_subject.into(),
        }
    }

    /// Consume the dispatch queue until it closes or `cancel` fires.
    ///
    /// Control commands run on their own task, so a command that waits on
    /// a worker (Execute) never blocks later commands — including the stop
    /// that would let that worker finish. Stdin items are forwarded inline
    /// to keep their bytes in arrival order. Total concurrency stays
    /// bounded by the connector's in-flight cap: every queued item's
    /// requester holds a permit until the reply is sent.
    pub async fn run(self, mut queue: mpsc::Receiver<WorkItem>, cancel: CancellationToken) {
        let this = Arc::new(self);
        loop {
            tokio::select! {
                maybe = queue.recv() => match maybe {
                    Some(item) if item.subject == this.control_subject => {
                        let this = Arc::clone(&this);
                        tokio::spawn(async move { this.handle_control(item).await });
                    }
                    Some(item) => this.handle_stdin(item).await,
                    None => break,
                },
                () = cancel.cancelled() => break,
            }
        }
        debug!("Dispatcher stopped");
    }

    #[cfg(test)]
    async fn handle(&self, item: WorkItem) {
        if item.subject == self.control_subject {
            self.handle_control(item).await;
        } else {
            self.handle_stdin(item).await;
        }
    }

    /// Raw stdin data: forwarded unparsed, acknowledged with an empty
    /// payload.
    async fn handle_stdin(&self, item: WorkItem) {
        match subject::worker_id_from_subject(&item.subject) {
            Some(worker_id) => {
                self.manager.forward_stdin(worker_id, &item.payload).await;
            }
            None => warn!(subject = %item.subject, "Stdin subject without a worker id, dropping"),
        }
        let _ = item.reply.send(Ok(Bytes::new()));
    }

    async fn handle_control(&self, item: WorkItem) {
        let reply = match self.decode_command(&item.payload) {
            Ok(command) => {
                let response = self.perform(command).await;
                match encode_reply(&response) {
                    Ok(bytes) => Ok(bytes.into()),
                    Err(e) => Err(e),
                }
            }
            // Rejected: the item never reaches the worker manager.
            Err(e @ CodecError::UnknownAction) => Err(ServiceError::new(
                ERR_INVALID_ACTION,
                format!("invalid action: {e}"),
            )),
            Err(e) => Err(ServiceError::new(
                ERR_INVALID_MESSAGE,
                format!("invalid message: {e}"),
            )),
        };
        let _ = item.reply.send(reply);
    }

    /// Decode a control payload: Action family first (legacy), then the
    /// Content family's start/stop requests. A well-formed frame that
    /// carries neither is an unknown action.
    fn decode_command(&self, payload: &[u8]) -> Result<Command, CodecError> {
        match codec::decode_action(payload) {
            Ok(action) => Ok(Command::Action(action)),
            Err(CodecError::UnknownAction) => match codec::decode_content(payload) {
                Ok(
                    content @ (Content::StartWorkerRequest { .. }
                    | Content::StopWorkerRequest { .. }),
                ) => Ok(Command::Content(content)),
                Ok(_) => Err(CodecError::UnknownMessage),
                Err(CodecError::UnknownMessage) => Err(CodecError::UnknownAction),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn perform(&self, command: Command) -> Reply {
        match command {
            Command::Action(action) => Reply::Response(self.perform_action(action).await),
            Command::Content(content) => Reply::Content(self.perform_content(content).await),
        }
    }

    /// Legacy Action commands. Manager errors travel as plain text inside
    /// the response variant, never as an RPC-level error.
    async fn perform_action(&self, action: Action) -> Response {
        match action {
            Action::CreateWorker { file, args, env } => {
                let spec = ProgramSpec {
                    file,
                    args: args.unwrap_or_default(),
                    env: env.unwrap_or_default(),
                };
                match self.manager.create(spec).await {
                    Ok(worker_id) => Response::CreateWorker {
                        worker_id,
                        error: None,
                    },
                    Err(e) => Response::CreateWorker {
                        worker_id: String::new(),
                        error: Some(format!("{e:#}")),
                    },
                }
            }
            Action::DestroyWorker { worker_id } => {
                match self.manager.destroy(&worker_id).await {
                    Ok(_) => Response::DestroyWorker {
                        worker_id,
                        error: None,
                    },
                    Err(e) => Response::DestroyWorker {
                        worker_id,
                        error: Some(format!("{e:#}")),
                    },
                }
            }
            Action::GetWorker { worker_id } => match self.manager.get(&worker_id).await {
                Ok(info) => Response::GetWorker {
                    worker_id: info.worker_id,
                    file: info.file,
                    status: info.status.to_string(),
                    error: None,
                },
                Err(e) => Response::GetWorker {
                    worker_id,
                    file: String::new(),
                    status: String::new(),
                    error: Some(format!("{e:#}")),
                },
            },
            Action::Execute { worker_id } => match self.manager.wait(&worker_id).await {
                Ok(status) => Response::Execute {
                    worker_id,
                    exit_code: status.exit_code(),
                    error: match status {
                        WorkerStatus::Failed(reason) => Some(reason),
                        _ => None,
                    },
                },
                Err(e) => Response::Execute {
                    worker_id,
                    exit_code: -1,
                    error: Some(format!("{e:#}")),
                },
            },
            Action::Dummy => Response::Dummy,
        }
    }

    /// Canonical Content commands.
    async fn perform_content(&self, content: Content) -> Content {
        match content {
            Content::StartWorkerRequest { file, args, env } => {
                let spec = ProgramSpec {
                    file,
                    args: args.unwrap_or_default(),
                    env: env.unwrap_or_default(),
                };
                match self.manager.create(spec).await {
                    Ok(worker_id) => Content::StartWorkerResponse {
                        worker_id,
                        error: None,
                    },
                    Err(e) => Content::StartWorkerResponse {
                        worker_id: String::new(),
                        error: Some(format!("{e:#}")),
                    },
                }
            }
            Content::StopWorkerRequest { worker_id } => {
                match self.manager.stop(&worker_id).await {
                    Ok(status) => Content::StopWorkerResponse {
                        worker_id,
                        exit_code: status.exit_code(),
                        error: None,
                    },
                    Err(e) => Content::StopWorkerResponse {
                        worker_id,
                        exit_code: -1,
                        error: Some(format!("{e:#}")),
                    },
                }
            }
            other => {
                // decode_command admits only start/stop requests.
                unreachable!("non-command content reached perform_content: {other:?}")
            }
        }
    }
}

enum Command {
    Action(Action),
    Content(Content),
}

enum Reply {
    Response(Response),
    Content(Content),
}

/// Encode a reply frame, mapping codec failures to the wire error codes.
fn encode_reply(reply: &Reply) -> Result<Vec<u8>, ServiceError> {
    let encoded = match reply {
        Reply::Response(response) => codec::encode_response(response),
        Reply::Content(content) => codec::encode_content(content),
    };
    encoded.map_err(|e| match e {
        // A result with no wire counterpart.
        CodecError::UnknownResponse | CodecError::UnknownMessage => {
            ServiceError::new(ERR_INVALID_RESPONSE, format!("invalid response: {e}"))
        }
        other => ServiceError::new(ERR_ENCODE_FAILED, format!("encode failed: {other}")),
    })
}
