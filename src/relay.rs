//! Per-transfer relay task.
//!
//! Each accepted transfer gets one relay: it accepts exactly two inbound
//! connections on its dedicated listener (the first is the sender's data
//! socket, the second the recipient's), forwards the framed handshake
//! between them, then pumps raw file bytes sender-to-recipient until EOF.
//! Every phase is bounded by a timeout and the copy loop honors the
//! ledger's cancellation signal between buffer fills. Whatever happens,
//! the relay releases both sockets, the listener, the port, and the
//! ledger entry, and broadcasts exactly one terminal notice.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::event::ServerEvent;
use crate::frame;
use crate::ledger::{PendingTransfer, TransferLedger};
use crate::registry::Registry;

/// Both peers must connect within this window.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);
/// Per-operation deadline during the data phase.
pub const IO_TIMEOUT: Duration = Duration::from_secs(300);

const COPY_BUFFER_SIZE: usize = 8 * 1024;
const PROGRESS_FLOOR_BYTES: u64 = 5 * 1024 * 1024;

enum Outcome {
    Complete,
    Failed(String),
    Cancelled,
}

pub async fn run(
    listener: TcpListener,
    pending: PendingTransfer,
    registry: Arc<Registry>,
    ledger: Arc<TransferLedger>,
    cancel: watch::Receiver<bool>,
) {
    let sender = pending.sender.clone();
    let recipient = pending.recipient.clone();

    let outcome = relay_transfer(listener, &registry, &sender, &recipient, cancel).await;
    ledger.finish(&sender, &recipient).await;

    let notice = match outcome {
        Ok(Outcome::Complete) => {
            info!(%sender, %recipient, "relay complete");
            ServerEvent::TransferComplete { sender, recipient }
        }
        Ok(Outcome::Cancelled) => {
            info!(%sender, %recipient, "relay cancelled");
            ServerEvent::TransferCancelled { sender, recipient }
        }
        Ok(Outcome::Failed(reason)) => {
            warn!(%sender, %recipient, %reason, "relay failed");
            ServerEvent::TransferFailed {
                sender,
                recipient,
                reason,
            }
        }
        Err(err) => {
            warn!(%sender, %recipient, error = %err, "relay failed");
            ServerEvent::TransferFailed {
                sender,
                recipient,
                reason: err.to_string(),
            }
        }
    };
    registry.broadcast(&notice.to_string(), None).await;
}

async fn relay_transfer(
    listener: TcpListener,
    registry: &Registry,
    sender: &str,
    recipient: &str,
    mut cancel: watch::Receiver<bool>,
) -> Result<Outcome> {
    let deadline = Instant::now() + ACCEPT_TIMEOUT;
    let (mut sender_sock, sender_addr) = accept_peer(&listener, deadline).await?;
    debug!(%sender, peer = %sender_addr, "sender data socket connected");
    let (mut recipient_sock, recipient_addr) = accept_peer(&listener, deadline).await?;
    debug!(%recipient, peer = %recipient_addr, "recipient data socket connected");
    // Both peers are in; the port can go back to the pool.
    drop(listener);

    // Metadata travels sender -> recipient verbatim.
    let filename = timed(frame::read_string(&mut sender_sock)).await?;
    let size = timed(frame::read_u64(&mut sender_sock)).await?;
    let checksum = timed(frame::read_string(&mut sender_sock)).await?;
    timed(frame::write_string(&mut recipient_sock, &filename)).await?;
    timed(frame::write_u64(&mut recipient_sock, size)).await?;
    timed(frame::write_string(&mut recipient_sock, &checksum)).await?;

    // Readiness and resume offset travel recipient -> sender.
    let readiness = timed(frame::read_string(&mut recipient_sock)).await?;
    timed(frame::write_string(&mut sender_sock, &readiness)).await?;
    if readiness != "READY" {
        return Ok(Outcome::Failed(format!("recipient not ready: {readiness}")));
    }
    let offset = timed(frame::read_u64(&mut recipient_sock)).await?;
    timed(frame::write_u64(&mut sender_sock, offset)).await?;

    match copy_bytes(
        &mut sender_sock,
        &mut recipient_sock,
        registry,
        sender,
        recipient,
        size,
        offset,
        &mut cancel,
    )
    .await?
    {
        CopyEnd::Eof => {}
        CopyEnd::Cancelled => return Ok(Outcome::Cancelled),
    }

    // Final status travels recipient -> sender and decides the result.
    let status = timed(frame::read_string(&mut recipient_sock)).await?;
    timed(frame::write_string(&mut sender_sock, &status)).await?;
    if status == "SUCCESS" {
        Ok(Outcome::Complete)
    } else {
        Ok(Outcome::Failed(status))
    }
}

enum CopyEnd {
    Eof,
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn copy_bytes(
    sender_sock: &mut TcpStream,
    recipient_sock: &mut TcpStream,
    registry: &Registry,
    sender: &str,
    recipient: &str,
    size: u64,
    offset: u64,
    cancel: &mut watch::Receiver<bool>,
) -> Result<CopyEnd> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut transferred = offset;
    let step = progress_step(size);
    let mut next_mark = (transferred / step + 1) * step;

    loop {
        let read = tokio::select! {
            changed = cancel.changed() => {
                // A dropped handle means the ledger entry was superseded;
                // treat it the same as an explicit cancel.
                if changed.is_err() || *cancel.borrow() {
                    return Ok(CopyEnd::Cancelled);
                }
                continue;
            }
            read = timeout(IO_TIMEOUT, sender_sock.read(&mut buf)) => {
                read.map_err(|_| anyhow!("timed out reading file bytes from sender"))?
                    .context("reading file bytes from sender")?
            }
        };
        if read == 0 {
            return Ok(CopyEnd::Eof);
        }

        timeout(IO_TIMEOUT, recipient_sock.write_all(&buf[..read]))
            .await
            .map_err(|_| anyhow!("timed out forwarding file bytes to recipient"))?
            .context("forwarding file bytes to recipient")?;

        transferred += read as u64;
        if transferred >= next_mark {
            next_mark = (transferred / step + 1) * step;
            let percent = if size > 0 {
                (transferred * 100 / size).min(100)
            } else {
                100
            };
            let progress = ServerEvent::TransferProgress {
                sender: sender.to_string(),
                recipient: recipient.to_string(),
                percent,
            };
            registry.broadcast(&progress.to_string(), None).await;
        }
    }
}

async fn accept_peer(
    listener: &TcpListener,
    deadline: Instant,
) -> Result<(TcpStream, std::net::SocketAddr)> {
    match timeout_at(deadline, listener.accept()).await {
        Ok(accepted) => accepted.context("accepting relay peer"),
        Err(_) => Err(anyhow!("timed out waiting for peers on the relay port")),
    }
}

async fn timed<T>(op: impl Future<Output = io::Result<T>>) -> Result<T> {
    match timeout(IO_TIMEOUT, op).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow!("relay I/O timed out")),
    }
}

/// Progress is announced each time cumulative bytes cross a multiple of
/// max(5% of the declared size, 5 MiB).
fn progress_step(size: u64) -> u64 {
    (size / 20).max(PROGRESS_FLOOR_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_step_has_a_floor() {
        assert_eq!(progress_step(0), PROGRESS_FLOOR_BYTES);
        assert_eq!(progress_step(10 * 1024 * 1024), PROGRESS_FLOOR_BYTES);
        assert_eq!(progress_step(200 * 1024 * 1024), PROGRESS_FLOOR_BYTES * 2);
    }
}
