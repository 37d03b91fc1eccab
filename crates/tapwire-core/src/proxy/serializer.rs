//! The per-connector write channel: every byte headed for the downstream
//! client passes through one bounded FIFO consumed by a single task, so
//! hook responses, relayed upstream responses, and control writes never
//! interleave on the wire.

use std::panic::{self, AssertUnwindSafe};

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::proxy::endpoint::ClientStream;
use crate::proxy::writer::{ResponseWriter, WriteFn};

/// Pending-job bound; enqueues block once this many writes are outstanding.
pub const WRITE_QUEUE_DEPTH: usize = 10;

pub enum WriteJob {
    /// Render a hook/management response through [`ResponseWriter`].
    Response(WriteFn),
    /// Pre-serialized bytes: relayed upstream responses and the CONNECT
    /// acknowledgement.
    Raw(Bytes),
    /// Hand the write half back to the connector (TLS upgrade, splice).
    /// The serializer resumes with the half sent back, or shuts down on
    /// `None`.
    Handoff(
        oneshot::Sender<WriteHalf<ClientStream>>,
        oneshot::Receiver<Option<WriteHalf<ClientStream>>>,
    ),
}

pub fn spawn(uid: u64, wr: WriteHalf<ClientStream>) -> mpsc::Sender<WriteJob> {
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    tokio::spawn(run(uid, wr, rx));
    tx
}

async fn run(uid: u64, mut wr: WriteHalf<ClientStream>, mut rx: mpsc::Receiver<WriteJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            WriteJob::Response(render) => {
                let mut buf = Vec::new();
                {
                    let mut writer = ResponseWriter::new(&mut buf);
                    // a panicking closure loses its response, not the connection
                    match panic::catch_unwind(AssertUnwindSafe(|| render(&mut writer))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(uid, "response writer failed: {e}");
                            continue;
                        }
                        Err(_) => {
                            error!(uid, "response writer panicked; dropping response");
                            continue;
                        }
                    }
                }
                write_all(uid, &mut wr, &buf).await;
            }
            WriteJob::Raw(bytes) => {
                write_all(uid, &mut wr, &bytes).await;
            }
            WriteJob::Handoff(give, back) => {
                if give.send(wr).is_err() {
                    return;
                }
                match back.await {
                    Ok(Some(resumed)) => wr = resumed,
                    _ => return,
                }
            }
        }
    }
}

async fn write_all(uid: u64, wr: &mut WriteHalf<ClientStream>, bytes: &[u8]) {
    if let Err(e) = wr.write_all(bytes).await {
        debug!(uid, "client write failed: {e}");
        return;
    }
    if let Err(e) = wr.flush().await {
        debug!(uid, "client flush failed: {e}");
    }
}
