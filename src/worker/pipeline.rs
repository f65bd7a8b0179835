//! Stdout streaming pipeline.
//!
//! Three stages under one fail-fast group, chained by bounded channels that
//! are single-producer/single-consumer by construction:
//!
//! 1. **Reader** pulls fixed-size chunks from the worker's stdout handle.
//! 2. **Encoder** wraps each chunk as an `UpdateWorkerStdio` frame.
//! 3. **Publisher** writes the frame to the worker's stdout subject.
//!
//! End-of-stream closes the chain front to back, so queued chunks drain in
//! strict read order before the stages exit. A read or encode error cancels
//! the group; a publish error is logged and the stage keeps consuming.
//! The Reader owns the stdout handle, so teardown drops it exactly once.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::codec::{self, Content};
use crate::taskgroup::TaskGroup;

/// Depth of the inter-stage channels.
const STAGE_DEPTH: usize = 16;

/// Start the pipeline under a child group of `parent`.
///
/// The caller must `wait()` the returned group; its resolution means all
/// three stages have observably stopped and the stdout handle is gone.
pub fn start(
    mut stdout: Box<dyn AsyncRead + Send + Unpin>,
    worker_id: String,
    stdout_subject: String,
    bus: Arc<dyn Bus>,
    chunk_size: usize,
    parent: &CancellationToken,
) -> TaskGroup {
    let mut group = TaskGroup::child_of(parent);
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(STAGE_DEPTH);
    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(STAGE_DEPTH);

    group.spawn("reader", move |token| async move {
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            tokio::select! {
                read = stdout.read(&mut buf) => {
                    let n = read.context("stdout read failed")?;
                    if n == 0 {
                        debug!("Stdout reached end of stream");
                        return Ok(());
                    }
                    if chunk_tx.send(buf[..n].to_vec()).await.is_err() {
                        return Ok(()); // encoder gone, group is winding down
                    }
                }
                () = token.cancelled() => return Ok(()),
            }
        }
    });

    let encoder_worker_id = worker_id;
    group.spawn("encoder", move |token| async move {
        loop {
            tokio::select! {
                maybe = chunk_rx.recv() => {
                    let Some(chunk) = maybe else { return Ok(()) };
                    let frame = codec::encode_content(&Content::UpdateWorkerStdio {
                        worker_id: encoder_worker_id.clone(),
                        payload: chunk,
                    })
                    .context("failed to encode stdio frame")?;
                    if frame_tx.send(frame).await.is_err() {
                        return Ok(());
                    }
                }
                () = token.cancelled() => return Ok(()),
            }
        }
    });

    group.spawn("publisher", move |token| async move {
        loop {
            tokio::select! {
                maybe = frame_rx.recv() => {
                    let Some(frame) = maybe else { return Ok(()) };
                    // Transient publish failures must not kill the stream.
                    if let Err(e) = bus.publish(&stdout_subject, frame.into()).await {
                        warn!(subject = %stdout_subject, error = %e, "Publish failed, dropping chunk");
                    }
                }
                () = token.cancelled() => return Ok(()),
            }
        }
    });

    group
}
