//! Routing-key construction.
//!
//! Subjects are hierarchical dotted strings built from fixed templates with
//! `%s` placeholders, substituted left to right. Templates are a wire
//! contract: they must match the controller byte for byte.

/// Placeholder marker inside subject templates.
const PLACEHOLDER: &str = "%s";

pub const WORKER_START: &str = "FJ.API.WORKER.START.%s.%s";
pub const WORKER_STOP: &str = "FJ.API.WORKER.STOP.%s.%s";
pub const WORKER_WRITE_STDIN: &str = "FJ.API.WORKER.WRITE.STDIN.%s.%s";
pub const WORKER_WRITE_STDOUT: &str = "FJ.API.WORKER.WRITE.STDOUT.%s.%s";
pub const WORKER_UPDATE_STATUS: &str = "FJ.API.WORKER.UPDATE.STATUS.%s.%s";
pub const CLIENT_UPDATE_INFO: &str = "FJ.API.CLIENT.UPDATE.INFO.%s";
pub const MESSAGE_REPLY: &str = "FJ.API.MESSAGE.REPLY.%s.%s";

/// Substitute `values` into `template`, one placeholder per value, left to
/// right. If fewer values than placeholders are supplied the scan stops
/// early and the remaining placeholders are left untouched — callers that
/// need full substitution must supply enough values. Empty strings are
/// valid values and produce adjacent delimiters.
pub fn fill(template: &str, values: &[&str]) -> String {
    let mut subject = template.to_string();
    for value in values {
        if !subject.contains(PLACEHOLDER) {
            break;
        }
        subject = subject.replacen(PLACEHOLDER, value, 1);
    }
    subject
}

pub fn worker_start(agent_id: &str, worker_id: &str) -> String {
    fill(WORKER_START, &[agent_id, worker_id])
}

pub fn worker_stop(agent_id: &str, worker_id: &str) -> String {
    fill(WORKER_STOP, &[agent_id, worker_id])
}

pub fn worker_write_stdin(agent_id: &str, worker_id: &str) -> String {
    fill(WORKER_WRITE_STDIN, &[agent_id, worker_id])
}

pub fn worker_write_stdout(agent_id: &str, worker_id: &str) -> String {
    fill(WORKER_WRITE_STDOUT, &[agent_id, worker_id])
}

pub fn worker_update_status(agent_id: &str, worker_id: &str) -> String {
    fill(WORKER_UPDATE_STATUS, &[agent_id, worker_id])
}

pub fn client_update_info(agent_id: &str) -> String {
    fill(CLIENT_UPDATE_INFO, &[agent_id])
}

pub fn message_reply(agent_id: &str, msg_id: &str) -> String {
    fill(MESSAGE_REPLY, &[agent_id, msg_id])
}

/// The trailing dotted token of a subject, used to address per-worker
/// stdin traffic.
pub fn worker_id_from_subject(subject: &str) -> Option<&str> {
    subject.rsplit('.').next().filter(|s| !s.is_empty())
}
