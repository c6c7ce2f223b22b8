//! The chat broker: accept loop plus a session handler per connection.
//!
//! A session moves through connecting -> active -> closed. The first line
//! a client sends is its desired username; an empty or already-held name
//! is rejected with a private error and the socket is closed. An active
//! session loops over command lines, touching the registry and ledger and
//! emitting broadcasts. All writes to a client go through its outbox so
//! the socket has a single writer.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::ClientCommand;
use crate::event::ServerEvent;
use crate::ledger::{self, TransferLedger};
use crate::registry::Registry;

pub const DEFAULT_PORT: u16 = 12345;

pub struct Broker {
    listener: TcpListener,
    registry: Arc<Registry>,
    ledger: Arc<TransferLedger>,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        let control_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(DEFAULT_PORT);
        Self {
            listener,
            registry: Arc::new(Registry::new()),
            ledger: Arc::new(TransferLedger::new(control_port)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker {
            listener,
            registry,
            ledger,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("broker shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => spawn_session(stream, peer, &registry, &ledger),
                        Err(err) => warn!(error = ?err, "failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    ledger: &Arc<TransferLedger>,
) {
    let registry = Arc::clone(registry);
    let ledger = Arc::clone(ledger);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, registry, ledger).await {
            debug!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<Registry>,
    ledger: Arc<TransferLedger>,
) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut username_line = String::new();
    if reader.read_line(&mut username_line).await? == 0 {
        return Ok(());
    }
    let username = username_line.trim().to_string();

    let (outbox, outbox_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(drain_outbox(outbox_rx, write_half));

    let registered = !username.is_empty() && registry.register(&username, outbox.clone()).await;
    if !registered {
        debug!(?peer, %username, "rejecting session");
        let _ = outbox.send("Username is invalid or already taken.".to_string());
        drop(outbox);
        let _ = writer_task.await;
        return Ok(());
    }

    info!(?peer, %username, "client joined");
    let joined = ServerEvent::Joined {
        username: username.clone(),
    };
    registry
        .broadcast(&joined.to_string(), Some(username.as_str()))
        .await;

    let result = run_session(&mut reader, &registry, &ledger, &username, &outbox).await;

    registry.unregister(&username).await;
    let left = ServerEvent::Left {
        username: username.clone(),
    };
    registry.broadcast(&left.to_string(), None).await;
    sweep_transfers(&registry, &ledger, &username).await;

    info!(?peer, %username, "client disconnected");
    drop(outbox);
    let _ = writer_task.await;
    result
}

/// Single writer per socket: everything queued for this session, private
/// replies and broadcasts alike, leaves through here.
async fn drain_outbox(mut outbox_rx: mpsc::UnboundedReceiver<String>, mut writer: OwnedWriteHalf) {
    while let Some(line) = outbox_rx.recv().await {
        if writer.write_all(line.as_bytes()).await.is_err()
            || writer.write_all(b"\n").await.is_err()
            || writer.flush().await.is_err()
        {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_session(
    reader: &mut BufReader<OwnedReadHalf>,
    registry: &Arc<Registry>,
    ledger: &Arc<TransferLedger>,
    username: &str,
    outbox: &mpsc::UnboundedSender<String>,
) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim().is_empty() {
            continue;
        }

        match ClientCommand::parse(trimmed) {
            Err(err) => {
                let _ = outbox.send(err.to_string());
            }
            Ok(command) => {
                if !dispatch(command, registry, ledger, username, outbox).await {
                    return Ok(());
                }
            }
        }
    }
}

/// Handle one command; returns false when the session should close.
async fn dispatch(
    command: ClientCommand,
    registry: &Arc<Registry>,
    ledger: &Arc<TransferLedger>,
    username: &str,
    outbox: &mpsc::UnboundedSender<String>,
) -> bool {
    match command {
        ClientCommand::Chat(text) => {
            let chat = ServerEvent::Chat {
                username: username.to_string(),
                text,
            };
            registry.broadcast(&chat.to_string(), Some(username)).await;
            true
        }
        ClientCommand::Who => {
            let list = ServerEvent::UserList {
                usernames: registry.list_online().await,
            };
            let _ = outbox.send(list.to_string());
            true
        }
        ClientCommand::Quit => false,
        ClientCommand::SendFile {
            recipient,
            filename,
            size_kb,
            checksum,
        } => {
            if !registry.is_online(&recipient).await {
                let _ = outbox.send(format!("User {recipient} is not online."));
                return true;
            }
            ledger
                .register(username, &recipient, &filename, size_kb, checksum.clone())
                .await;
            let initiated = ServerEvent::TransferInitiated {
                sender: username.to_string(),
                recipient,
                filename,
                size_kb,
                checksum,
            };
            registry.broadcast(&initiated.to_string(), None).await;
            true
        }
        ClientCommand::AcceptFile { sender } => {
            match ledger.get(&sender, username).await {
                None => {
                    let _ = outbox.send(format!("No pending file transfer from {sender}"));
                }
                Some(pending) if pending.port.is_some() => {
                    let _ = outbox.send(format!("Transfer from {sender} is already in progress"));
                }
                Some(pending) => {
                    let accepted = ServerEvent::TransferAccepted {
                        sender: pending.sender.clone(),
                        recipient: pending.recipient.clone(),
                        filename: pending.filename.clone(),
                        size_kb: pending.size_kb,
                    };
                    registry.broadcast(&accepted.to_string(), None).await;
                    ledger::start_transfer(Arc::clone(registry), Arc::clone(ledger), pending).await;
                }
            }
            true
        }
        ClientCommand::RejectFile { sender } => {
            match ledger.remove(&sender, username).await {
                Some(entry) => {
                    let rejected = ServerEvent::TransferRejected {
                        sender: entry.sender,
                        recipient: entry.recipient,
                    };
                    registry.broadcast(&rejected.to_string(), None).await;
                }
                None => {
                    let _ = outbox.send(format!("No pending file transfer from {sender}"));
                }
            }
            true
        }
        ClientCommand::CancelTransfer => {
            sweep_transfers(registry, ledger, username).await;
            true
        }
        ClientCommand::Unknown(command) => {
            let _ = outbox.send(format!("Unknown command: {command}"));
            true
        }
    }
}

/// Remove every negotiation naming the user, announcing each; in-flight
/// relays are signalled and announce their own termination.
async fn sweep_transfers(registry: &Arc<Registry>, ledger: &Arc<TransferLedger>, username: &str) {
    for entry in ledger.cancel_for_user(username).await {
        let cancelled = ServerEvent::TransferCancelled {
            sender: entry.sender,
            recipient: entry.recipient,
        };
        registry.broadcast(&cancelled.to_string(), None).await;
    }
}
