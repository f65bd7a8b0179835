//! Frame layout and the message families it carries.
//!
//! A frame is the single wire unit. It carries at most one variant out of
//! three records (content, action, response), each record a fixed run of
//! presence-flagged slots. The slot order below is a hard wire contract:
//! decoding parses every present slot and the *first present slot in slot
//! order* wins. Encoders populate exactly one slot.
//!
//! Layout:
//!
//! ```text
//! [u8 version = 1]
//! [content record: 7 presence-flagged slots]
//!     StartWorkerRequest, StartWorkerResponse, StopWorkerRequest,
//!     StopWorkerResponse, UpdateWorkerStatus, UpdateWorkerStdio,
//!     UpdateClientInfo
//! [action record: 5 presence-flagged slots]
//!     CreateWorker, DestroyWorker, GetWorker, Execute, Dummy
//! [response record: 5 presence-flagged slots]
//!     CreateWorker, DestroyWorker, GetWorker, Execute, Dummy
//! ```

use super::wire::{Reader, Writer};
use super::{CodecError, MalformedFrame};

/// Wire format version carried in the first byte of every frame.
pub const WIRE_VERSION: u8 = 1;

const CONTENT_SLOTS: usize = 7;
const ACTION_SLOTS: usize = 5;
const RESPONSE_SLOTS: usize = 5;

/// Fire-and-forget / streamed messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    StartWorkerRequest {
        file: String,
        args: Option<Vec<String>>,
        env: Option<Vec<String>>,
    },
    StartWorkerResponse {
        worker_id: String,
        error: Option<String>,
    },
    StopWorkerRequest {
        worker_id: String,
    },
    StopWorkerResponse {
        worker_id: String,
        exit_code: i64,
        error: Option<String>,
    },
    UpdateWorkerStatus {
        worker_id: String,
        status: String,
    },
    UpdateWorkerStdio {
        worker_id: String,
        payload: Vec<u8>,
    },
    UpdateClientInfo {
        agent_id: String,
        hostname: String,
    },
}

impl Content {
    const fn slot(&self) -> usize {
        match self {
            Self::StartWorkerRequest { .. } => 0,
            Self::StartWorkerResponse { .. } => 1,
            Self::StopWorkerRequest { .. } => 2,
            Self::StopWorkerResponse { .. } => 3,
            Self::UpdateWorkerStatus { .. } => 4,
            Self::UpdateWorkerStdio { .. } => 5,
            Self::UpdateClientInfo { .. } => 6,
        }
    }

    fn write_body(&self, w: &mut Writer) -> Result<(), CodecError> {
        match self {
            Self::StartWorkerRequest { file, args, env } => {
                w.put_str(file)?;
                w.put_opt_str_seq(args.as_deref())?;
                w.put_opt_str_seq(env.as_deref())?;
            }
            Self::StartWorkerResponse { worker_id, error } => {
                w.put_str(worker_id)?;
                w.put_opt_str(error.as_deref())?;
            }
            Self::StopWorkerRequest { worker_id } => {
                w.put_str(worker_id)?;
            }
            Self::StopWorkerResponse {
                worker_id,
                exit_code,
                error,
            } => {
                w.put_str(worker_id)?;
                w.put_i64(*exit_code);
                w.put_opt_str(error.as_deref())?;
            }
            Self::UpdateWorkerStatus { worker_id, status } => {
                w.put_str(worker_id)?;
                w.put_str(status)?;
            }
            Self::UpdateWorkerStdio { worker_id, payload } => {
                w.put_str(worker_id)?;
                w.put_bytes(payload)?;
            }
            Self::UpdateClientInfo { agent_id, hostname } => {
                w.put_str(agent_id)?;
                w.put_str(hostname)?;
            }
        }
        Ok(())
    }

    fn read_body(slot: usize, r: &mut Reader<'_>) -> Result<Self, CodecError> {
        match slot {
            0 => Ok(Self::StartWorkerRequest {
                file: r.get_str()?,
                args: r.get_opt_str_seq()?,
                env: r.get_opt_str_seq()?,
            }),
            1 => Ok(Self::StartWorkerResponse {
                worker_id: r.get_str()?,
                error: r.get_opt_str()?,
            }),
            2 => Ok(Self::StopWorkerRequest {
                worker_id: r.get_str()?,
            }),
            3 => Ok(Self::StopWorkerResponse {
                worker_id: r.get_str()?,
                exit_code: r.get_i64()?,
                error: r.get_opt_str()?,
            }),
            4 => Ok(Self::UpdateWorkerStatus {
                worker_id: r.get_str()?,
                status: r.get_str()?,
            }),
            5 => Ok(Self::UpdateWorkerStdio {
                worker_id: r.get_str()?,
                payload: r.get_bytes()?,
            }),
            6 => Ok(Self::UpdateClientInfo {
                agent_id: r.get_str()?,
                hostname: r.get_str()?,
            }),
            _ => unreachable!("slot index out of range"),
        }
    }
}

/// Legacy synchronous worker commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateWorker {
        file: String,
        args: Option<Vec<String>>,
        env: Option<Vec<String>>,
    },
    DestroyWorker {
        worker_id: String,
    },
    GetWorker {
        worker_id: String,
    },
    Execute {
        worker_id: String,
    },
    Dummy,
}

impl Action {
    const fn slot(&self) -> usize {
        match self {
            Self::CreateWorker { .. } => 0,
            Self::DestroyWorker { .. } => 1,
            Self::GetWorker { .. } => 2,
            Self::Execute { .. } => 3,
            Self::Dummy => 4,
        }
    }

    fn write_body(&self, w: &mut Writer) -> Result<(), CodecError> {
        match self {
            Self::CreateWorker { file, args, env } => {
                w.put_str(file)?;
                w.put_opt_str_seq(args.as_deref())?;
                w.put_opt_str_seq(env.as_deref())?;
            }
            Self::DestroyWorker { worker_id }
            | Self::GetWorker { worker_id }
            | Self::Execute { worker_id } => {
                w.put_str(worker_id)?;
            }
            Self::Dummy => {}
        }
        Ok(())
    }

    fn read_body(slot: usize, r: &mut Reader<'_>) -> Result<Self, CodecError> {
        match slot {
            0 => Ok(Self::CreateWorker {
                file: r.get_str()?,
                args: r.get_opt_str_seq()?,
                env: r.get_opt_str_seq()?,
            }),
            1 => Ok(Self::DestroyWorker {
                worker_id: r.get_str()?,
            }),
            2 => Ok(Self::GetWorker {
                worker_id: r.get_str()?,
            }),
            3 => Ok(Self::Execute {
                worker_id: r.get_str()?,
            }),
            4 => Ok(Self::Dummy),
            _ => unreachable!("slot index out of range"),
        }
    }
}

/// Replies to the legacy synchronous commands.
///
/// Errors travel as plain descriptive text. Decoding reconstructs only the
/// text, never the original error kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    CreateWorker {
        worker_id: String,
        error: Option<String>,
    },
    DestroyWorker {
        worker_id: String,
        error: Option<String>,
    },
    GetWorker {
        worker_id: String,
        file: String,
        status: String,
        error: Option<String>,
    },
    Execute {
        worker_id: String,
        exit_code: i64,
        error: Option<String>,
    },
    Dummy,
}

impl Response {
    const fn slot(&self) -> usize {
        match self {
            Self::CreateWorker { .. } => 0,
            Self::DestroyWorker { .. } => 1,
            Self::GetWorker { .. } => 2,
            Self::Execute { .. } => 3,
            Self::Dummy => 4,
        }
    }

    fn write_body(&self, w: &mut Writer) -> Result<(), CodecError> {
        match self {
            Self::CreateWorker { worker_id, error }
            | Self::DestroyWorker { worker_id, error } => {
                w.put_str(worker_id)?;
                w.put_opt_str(error.as_deref())?;
            }
            Self::GetWorker {
                worker_id,
                file,
                status,
                error,
            } => {
                w.put_str(worker_id)?;
                w.put_str(file)?;
                w.put_str(status)?;
                w.put_opt_str(error.as_deref())?;
            }
            Self::Execute {
                worker_id,
                exit_code,
                error,
            } => {
                w.put_str(worker_id)?;
                w.put_i64(*exit_code);
                w.put_opt_str(error.as_deref())?;
            }
            Self::Dummy => {}
        }
        Ok(())
    }

    fn read_body(slot: usize, r: &mut Reader<'_>) -> Result<Self, CodecError> {
        match slot {
            0 => Ok(Self::CreateWorker {
                worker_id: r.get_str()?,
                error: r.get_opt_str()?,
            }),
            1 => Ok(Self::DestroyWorker {
                worker_id: r.get_str()?,
                error: r.get_opt_str()?,
            }),
            2 => Ok(Self::GetWorker {
                worker_id: r.get_str()?,
                file: r.get_str()?,
                status: r.get_str()?,
                error: r.get_opt_str()?,
            }),
            3 => Ok(Self::Execute {
                worker_id: r.get_str()?,
                exit_code: r.get_i64()?,
                error: r.get_opt_str()?,
            }),
            4 => Ok(Self::Dummy),
            _ => unreachable!("slot index out of range"),
        }
    }
}

/// A decoded frame: at most one populated variant across the three records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub content: Option<Content>,
    pub action: Option<Action>,
    pub response: Option<Response>,
}

impl Frame {
    pub fn content(content: Content) -> Self {
        Self {
            content: Some(content),
            ..Self::default()
        }
    }

    pub fn action(action: Action) -> Self {
        Self {
            action: Some(action),
            ..Self::default()
        }
    }

    pub fn response(response: Response) -> Self {
        Self {
            response: Some(response),
            ..Self::default()
        }
    }

    /// Serialize the frame. A frame with no populated variant is
    /// unrepresentable on the wire and yields [`CodecError::UnknownMessage`].
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.content.is_none() && self.action.is_none() && self.response.is_none() {
            return Err(CodecError::UnknownMessage);
        }

        let mut w = Writer::new();
        w.put_u8(WIRE_VERSION);

        write_record(&mut w, CONTENT_SLOTS, self.content.as_ref().map(Content::slot), |w| {
            match &self.content {
                Some(c) => c.write_body(w),
                None => Ok(()),
            }
        })?;
        write_record(&mut w, ACTION_SLOTS, self.action.as_ref().map(Action::slot), |w| {
            match &self.action {
                Some(a) => a.write_body(w),
                None => Ok(()),
            }
        })?;
        write_record(&mut w, RESPONSE_SLOTS, self.response.as_ref().map(Response::slot), |w| {
            match &self.response {
                Some(r) => r.write_body(w),
                None => Ok(()),
            }
        })?;

        Ok(w.into_bytes())
    }

    /// Parse a frame. Malformed or truncated input yields
    /// [`CodecError::Malformed`]; the absence of any populated variant is
    /// *not* an error at this level (see the `decode_*` entry points).
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);

        let version = r.get_u8()?;
        if version != WIRE_VERSION {
            return Err(CodecError::Malformed(MalformedFrame::BadVersion(version)));
        }

        let content = read_record(&mut r, CONTENT_SLOTS, Content::read_body)?;
        let action = read_record(&mut r, ACTION_SLOTS, Action::read_body)?;
        let response = read_record(&mut r, RESPONSE_SLOTS, Response::read_body)?;

        if !r.is_exhausted() {
            return Err(CodecError::Malformed(MalformedFrame::TrailingBytes));
        }

        Ok(Self {
            content,
            action,
            response,
        })
    }
}

/// Write one record: `slots` presence bytes, with the body inline after the
/// populated slot's flag.
fn write_record(
    w: &mut Writer,
    slots: usize,
    populated: Option<usize>,
    write_body: impl FnOnce(&mut Writer) -> Result<(), CodecError>,
) -> Result<(), CodecError> {
    let mut write_body = Some(write_body);
    for slot in 0..slots {
        if populated == Some(slot) {
            w.put_u8(1);
            if let Some(f) = write_body.take() {
                f(w)?;
            }
        } else {
            w.put_u8(0);
        }
    }
    Ok(())
}

/// Read one record. Every present slot is parsed; the first present slot in
/// slot order wins, later ones are discarded.
fn read_record<T>(
    r: &mut Reader<'_>,
    slots: usize,
    read_body: impl Fn(usize, &mut Reader<'_>) -> Result<T, CodecError>,
) -> Result<Option<T>, CodecError> {
    let mut first: Option<T> = None;
    for slot in 0..slots {
        if let Some(value) = r.get_opt_record(|r| read_body(slot, r))? {
            if first.is_none() {
                first = Some(value);
            }
        }
    }
    Ok(first)
}
